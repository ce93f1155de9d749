//! Parsing of ssh destination strings and construction of client commands.
//!
//! A destination is `[user@]host[:port]`. Several destinations can be grouped
//! as interchangeable routes to the same logical machine (different NICs or
//! VLANs); the session machine rotates through them on reconnect.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::error::DestinationError;

pub const DEFAULT_PORT: u16 = 22;

static DESTINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?<user>[^@]+)@)?(?<host>[^:]+)(?::(?<port>\d+))?$")
        .expect("destination pattern is valid")
});

/// A resolved connection endpoint. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// The `user@host` form the ssh client takes as its target argument.
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Fallbacks applied to fields a destination string leaves out.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    /// User to assume when the string has no `user@` part. When this is also
    /// unset, the current OS user is used.
    pub user: Option<String>,
}

/// Parse a `[user@]host[:port]` destination string.
///
/// More than one `:`-delimited suffix is invalid (`host:22:33` is rejected,
/// not reinterpreted). Missing port defaults to 22.
pub fn parse_destination(input: &str, defaults: &Defaults) -> Result<Endpoint, DestinationError> {
    let captures = DESTINATION
        .captures(input)
        .ok_or_else(|| DestinationError::InvalidSyntax {
            input: input.to_string(),
        })?;

    let host = captures
        .name("host")
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| DestinationError::InvalidSyntax {
            input: input.to_string(),
        })?;

    let port = match captures.name("port") {
        Some(m) => m
            .as_str()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| DestinationError::InvalidPort {
                input: input.to_string(),
            })?,
        None => DEFAULT_PORT,
    };

    let user = match captures.name("user") {
        Some(m) => m.as_str().to_string(),
        None => match &defaults.user {
            Some(user) => user.clone(),
            None => current_os_user().ok_or_else(|| DestinationError::UnknownUser {
                input: input.to_string(),
            })?,
        },
    };

    Ok(Endpoint { user, host, port })
}

fn current_os_user() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
}

/// An ordered, non-empty set of endpoints treated as interchangeable routes
/// to one logical machine. Rotation state lives here and deliberately
/// survives reconnects, so repeated failures walk the alternatives instead
/// of hammering one dead route.
#[derive(Debug, Clone)]
pub struct TargetGroup {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

impl TargetGroup {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, DestinationError> {
        if endpoints.is_empty() {
            return Err(DestinationError::EmptyGroup);
        }
        Ok(Self {
            endpoints,
            cursor: 0,
        })
    }

    /// Parse a list of destination strings into one group.
    pub fn from_strings<I, S>(inputs: I, defaults: &Defaults) -> Result<Self, DestinationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = inputs
            .into_iter()
            .map(|input| parse_destination(input.as_ref().trim(), defaults))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints)
    }

    /// The endpoint to use for the next connection attempt, advancing the
    /// round-robin cursor.
    pub fn next_endpoint(&mut self) -> &Endpoint {
        let picked = self.cursor;
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        &self.endpoints[picked]
    }

    /// Label identifying this group in logs: its first host.
    pub fn label(&self) -> &str {
        &self.endpoints[0].host
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Builds the concrete subprocess command line for one connection attempt.
///
/// Pseudo-terminal allocation (`-tt`) is mandatory: the initramfs prompt only
/// behaves interactively with a pty. The program and remote shell are
/// configurable so tests can substitute a scripted stand-in for ssh.
#[derive(Debug, Clone)]
pub struct ClientCommand {
    pub program: String,
    pub connect_timeout: Duration,
    pub remote_shell: String,
}

impl Default for ClientCommand {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(5),
            remote_shell: "bash".to_string(),
        }
    }
}

impl ClientCommand {
    /// Produce the command line for one endpoint. Pure construction; nothing
    /// is spawned here.
    pub fn build(&self, endpoint: &Endpoint) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-tt")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        if endpoint.port != DEFAULT_PORT {
            command.arg("-p").arg(endpoint.port.to_string());
        }
        command.arg(endpoint.target()).arg(&self.remote_shell);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_defaults() -> Defaults {
        Defaults::default()
    }

    fn default_user(user: &str) -> Defaults {
        Defaults {
            user: Some(user.to_string()),
        }
    }

    fn endpoint(user: &str, host: &str, port: u16) -> Endpoint {
        Endpoint {
            user: user.to_string(),
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn parses_all_four_forms() {
        assert_eq!(
            parse_destination("user@host:22", &no_defaults()).unwrap(),
            endpoint("user", "host", 22)
        );
        assert_eq!(
            parse_destination("user@host", &no_defaults()).unwrap(),
            endpoint("user", "host", 22)
        );
        assert_eq!(
            parse_destination("host:22", &default_user("default-user")).unwrap(),
            endpoint("default-user", "host", 22)
        );
        assert_eq!(
            parse_destination("host", &default_user("default-user")).unwrap(),
            endpoint("default-user", "host", 22)
        );
    }

    #[test]
    fn rejects_double_port_suffix() {
        assert!(parse_destination("user@host:22:33", &no_defaults()).is_err());
        assert!(parse_destination("host:22:33", &no_defaults()).is_err());
    }

    #[test]
    fn rejects_port_zero_and_overflow() {
        assert!(matches!(
            parse_destination("host:0", &default_user("u")),
            Err(DestinationError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_destination("host:70000", &default_user("u")),
            Err(DestinationError::InvalidPort { .. })
        ));
    }

    #[test]
    fn nonstandard_port_is_kept() {
        assert_eq!(
            parse_destination("host:2222", &default_user("u")).unwrap(),
            endpoint("u", "host", 2222)
        );
    }

    #[test]
    fn rotation_survives_across_calls() {
        let mut group = TargetGroup::from_strings(["a", "b", "c"], &default_user("u")).unwrap();
        let picked: Vec<String> = (0..5)
            .map(|_| group.next_endpoint().host.clone())
            .collect();
        assert_eq!(picked, ["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(matches!(
            TargetGroup::new(Vec::new()),
            Err(DestinationError::EmptyGroup)
        ));
    }

    #[test]
    fn client_command_line() {
        let command = ClientCommand::default().build(&endpoint("root", "server", 22));
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(command.as_std().get_program(), "ssh");
        assert_eq!(
            args,
            ["-tt", "-o", "ConnectTimeout=5", "root@server", "bash"]
        );
    }

    #[test]
    fn client_command_line_with_nonstandard_port() {
        let command = ClientCommand::default().build(&endpoint("root", "server", 2222));
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["-tt", "-o", "ConnectTimeout=5", "-p", "2222", "root@server", "bash"]
        );
    }
}
