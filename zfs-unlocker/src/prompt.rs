//! Prompt classification for observed session output.
//!
//! Two prompt forms matter: the initramfs ZFS unlock prompt (asking for a
//! decryption passphrase) and a generic interactive shell prompt (meaning the
//! machine is up, or at least far enough along that no passphrase is needed).
//! Everything else is noise to be logged and skipped.

use std::sync::LazyLock;

use regex::Regex;

static SHELL_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[$#]\s*$").expect("shell prompt pattern is valid"));

/// The unlock prompt as printed by the initramfs hook: a banner line, an
/// instruction line, then the passphrase cue. Blank lines and punctuation in
/// between vary with whether the session got a pseudo-terminal, as does the
/// presence of a trailing newline, so the pattern is deliberately loose there.
static UNLOCK_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"Unlocking encrypted ZFS filesystems\.*\s*",
        r"Enter the password or press Ctrl-C to exit\.",
        r"[^A-Za-z0-9]*",
        r"(?:Encrypted ZFS password for [^:]+:\s*\(press TAB for no echo\))?",
        r"\s*$",
    ))
    .expect("unlock prompt pattern is valid")
});

/// What a piece of observed output looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// The ZFS passphrase prompt.
    Unlock,
    /// A generic shell prompt.
    Shell,
    /// Neither; keep reading.
    Other,
}

/// True if the text, right-trimmed of trailing whitespace, ends in `$` or `#`.
///
/// Matches bare prompts (`$ `) as well as decorated ones (`user@host:~# `).
pub fn is_shell_prompt(text: &str) -> bool {
    SHELL_PROMPT.is_match(text)
}

/// True if the text ends with the initramfs ZFS unlock prompt.
pub fn is_unlock_prompt(text: &str) -> bool {
    UNLOCK_PROMPT.is_match(text)
}

/// Classify observed output. The unlock prompt is checked first: its tail is
/// also a plausible shell prompt tail, and entering the passphrase is the
/// action that must win if both ever match.
pub fn classify(text: &str) -> PromptKind {
    if is_unlock_prompt(text) {
        PromptKind::Unlock
    } else if is_shell_prompt(text) {
        PromptKind::Shell
    } else {
        PromptKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERACTIVE_PROMPT: &str = "\nUnlocking encrypted ZFS filesystems...\n\
         Enter the password or press Ctrl-C to exit.\n\
         \n\
         \u{1f510} Encrypted ZFS password for rpool/ROOT: (press TAB for no echo) ";

    #[test]
    fn shell_prompt_forms() {
        assert!(is_shell_prompt("$ "));
        assert!(is_shell_prompt("# "));
        assert!(is_shell_prompt("root@host:~$ "));
        assert!(is_shell_prompt("root@host:~# "));
    }

    #[test]
    fn shell_prompt_rejects_plain_text() {
        assert!(!is_shell_prompt("Loading, please wait..."));
        assert!(!is_shell_prompt("Begin: Running /scripts/init-bottom ... done."));
    }

    #[test]
    fn unlock_prompt_interactive_tt() {
        assert!(is_unlock_prompt(INTERACTIVE_PROMPT));
    }

    #[test]
    fn unlock_prompt_non_interactive_trailing_newline() {
        let with_newline = format!("{INTERACTIVE_PROMPT}\n");
        assert!(is_unlock_prompt(&with_newline));
    }

    #[test]
    fn unlock_prompt_rejects_shell_prompts() {
        assert!(!is_unlock_prompt("root@host:~$ "));
        assert!(!is_unlock_prompt("root@host:~# "));
    }

    #[test]
    fn unlock_prompt_without_password_cue() {
        // Without a pty the cue line may lag behind the banner; the banner
        // and instruction alone are decisive.
        let text = "Unlocking encrypted ZFS filesystems...\n\
                    Enter the password or press Ctrl-C to exit.\n";
        assert!(is_unlock_prompt(text));
    }

    #[test]
    fn classify_prefers_unlock_over_shell() {
        // Synthetic text whose tail satisfies both patterns.
        let text = "Unlocking encrypted ZFS filesystems...\n\
                    Enter the password or press Ctrl-C to exit.\n#";
        assert!(is_shell_prompt(text));
        assert_eq!(classify(text), PromptKind::Unlock);
    }

    #[test]
    fn classify_falls_through_to_other() {
        assert_eq!(classify("Loading initial ramdisk"), PromptKind::Other);
        assert_eq!(classify("root@host:~$ "), PromptKind::Shell);
        assert_eq!(classify(INTERACTIVE_PROMPT), PromptKind::Unlock);
    }
}
