//! Interactive nsupdate session driver.
//!
//! One [`UpdateSession`] owns one update program process. Commands are
//! streamed to its stdin as the pipeline walks the requested records, and a
//! single `send` commits the batch when the session is closed.
//!
//! ```text
//! NotStarted --start--> Open --authenticate--> Authenticated
//!                                                   |
//!                                 delete/update     v
//!                                            PendingCommit --close--> Closed
//! ```
//!
//! Calling an operation from a state that does not allow it returns
//! [`DdnsError::InvalidTransition`].

use crate::addr::RecordType;
use crate::config::Config;
use crate::error::{DdnsError, Result};
use crate::extractor::Action;
use crate::names::escape;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One desired change for one record name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRequest {
    /// Domain token as requested.
    pub domain: String,
    pub fqdn: String,
    pub zone: String,
    pub key_name: String,
    pub secret: String,
    pub record_type: RecordType,
    /// Empty for deletes that remove every value of the type.
    pub value: String,
    pub action: Action,
}

/// Everything a session needs from the configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub binary: String,
    pub args: Vec<String>,
    pub server: String,
    pub ttl: u32,
    pub log_commands: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.nsupdate_binary.clone(),
            args: config.nsupdate_args.clone(),
            server: config.server.clone(),
            ttl: config.record_ttl,
            log_commands: config.log_commands(),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Open,
    Authenticated,
    PendingCommit,
    Closed,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::NotStarted => "not started",
            SessionState::Open => "open",
            SessionState::Authenticated => "authenticated",
            SessionState::PendingCommit => "pending commit",
            SessionState::Closed => "closed",
        }
    }
}

/// An open update program process.
pub struct UpdateSession {
    settings: SessionSettings,
    state: SessionState,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    transcript: Vec<String>,
}

impl UpdateSession {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: SessionState::NotStarted,
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
            transcript: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Commands written so far, without trailing newlines.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    fn invalid(&self, operation: &'static str) -> DdnsError {
        DdnsError::InvalidTransition {
            state: self.state.as_str(),
            operation,
        }
    }

    /// Spawn the update program with piped stdin, stdout and stderr.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::NotStarted {
            return Err(self.invalid("start"));
        }

        debug!(
            "Starting {} {}",
            self.settings.binary,
            self.settings.args.join(" ")
        );

        let mut child = Command::new(&self.settings.binary)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DdnsError::Spawn(format!("{}: {}", self.settings.binary, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DdnsError::Spawn("stdin of update program unavailable".to_string()))?;

        self.stdout = child.stdout.take().map(collect);
        self.stderr = child.stderr.take().map(collect);
        self.stdin = Some(BufWriter::new(stdin));
        self.child = Some(child);
        self.state = SessionState::Open;
        Ok(())
    }

    async fn write(&mut self, command: String) -> Result<()> {
        if self.settings.log_commands {
            info!(target: "nsupdate", "nsupdate: {}", command.replace('\n', "\\n"));
        }

        let stdin = self.stdin.as_mut().ok_or_else(|| DdnsError::InvalidTransition {
            state: self.state.as_str(),
            operation: "write",
        })?;
        stdin.write_all(command.as_bytes()).await?;
        self.transcript
            .push(command.trim_end_matches('\n').to_string());
        Ok(())
    }

    /// Emit `server`, `zone` and `key` lines. A no-op once they were sent.
    pub async fn authenticate(&mut self, zone: &str, key_name: &str, secret: &str) -> Result<()> {
        match self.state {
            SessionState::Open => {}
            SessionState::Authenticated | SessionState::PendingCommit => return Ok(()),
            SessionState::NotStarted | SessionState::Closed => {
                return Err(self.invalid("authenticate"))
            }
        }

        self.write(format!("server {}\n", self.settings.server))
            .await?;
        if !zone.is_empty() {
            self.write(format!("zone {}.\n", zone)).await?;
        }
        if !key_name.is_empty() {
            self.write(format!(
                "key hmac-sha256:ddns-key.{} {}\n",
                escape(key_name),
                escape(secret)
            ))
            .await?;
        }

        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Queue removal of every `record_type` value of `req.fqdn`.
    pub async fn delete_record(&mut self, req: &RecordRequest) -> Result<()> {
        self.authenticate(&req.zone, &req.key_name, &req.secret)
            .await?;
        self.write(format!("update delete {} {}\n", req.fqdn, req.record_type))
            .await?;
        self.state = SessionState::PendingCommit;
        Ok(())
    }

    /// Queue replacement of `req.fqdn`'s `record_type` values with `req.value`.
    pub async fn update_record(&mut self, req: &RecordRequest) -> Result<()> {
        self.delete_record(req).await?;
        let value = match req.record_type {
            RecordType::Txt => format!("\"{}\"", escape(&req.value)),
            _ => escape(&req.value),
        };
        self.write(format!(
            "update add {} {} {} {}\n",
            req.fqdn, self.settings.ttl, req.record_type, value
        ))
        .await
    }

    /// Queue `req` according to its action.
    pub async fn apply(&mut self, req: &RecordRequest) -> Result<()> {
        match req.action {
            Action::Update => self.update_record(req).await,
            Action::Delete => self.delete_record(req).await,
        }
    }

    /// Commit pending commands, quit, and wait for the program to exit.
    ///
    /// Returns the program's stdout on a clean exit. A non-zero exit or a
    /// failed wait yields `"<error>: <stderr>"`; a clean exit with stderr
    /// output yields the stderr text.
    pub async fn close(&mut self) -> Result<String> {
        match self.state {
            SessionState::NotStarted | SessionState::Closed => return Err(self.invalid("close")),
            _ => {}
        }

        let mut write_error = None;
        if self.state == SessionState::PendingCommit {
            if let Err(e) = self.write("send\n".to_string()).await {
                write_error = Some(e);
            }
        }
        if write_error.is_none() {
            if let Err(e) = self.write("quit\n".to_string()).await {
                write_error = Some(e);
            }
        }
        if let Some(mut stdin) = self.stdin.take() {
            let flushed = async {
                stdin.flush().await?;
                stdin.shutdown().await
            };
            if let Err(e) = flushed.await {
                if write_error.is_none() {
                    write_error = Some(DdnsError::Io(e));
                }
            }
        }

        self.state = SessionState::Closed;

        let status = match self.child.take() {
            Some(mut child) => child.wait().await,
            None => return Err(self.invalid("wait")),
        };
        let stdout = output(self.stdout.take()).await;
        let stderr = output(self.stderr.take()).await;

        match status {
            Err(e) => Err(DdnsError::Session(format!("{}: {}", e, stderr))),
            Ok(status) if !status.success() => {
                Err(DdnsError::Session(format!("{}: {}", status, stderr)))
            }
            Ok(_) => {
                if let Some(e) = write_error {
                    return Err(DdnsError::Session(format!("{}: {}", e, stderr)));
                }
                if !stderr.trim().is_empty() {
                    return Err(DdnsError::Session(stderr.trim().to_string()));
                }
                debug!("Update session closed cleanly");
                Ok(stdout)
            }
        }
    }
}

fn collect<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => handle
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(binary: &str, args: &[&str]) -> SessionSettings {
        SessionSettings {
            binary: binary.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            server: "ns.example.org".to_string(),
            ttl: 300,
            log_commands: true,
        }
    }

    fn record(action: Action) -> RecordRequest {
        RecordRequest {
            domain: "foo".to_string(),
            fqdn: "foo.example.org".to_string(),
            zone: "example.org".to_string(),
            key_name: "example.org".to_string(),
            secret: "c2VjcmV0".to_string(),
            record_type: RecordType::A,
            value: "1.2.3.4".to_string(),
            action,
        }
    }

    #[tokio::test]
    async fn test_authenticate_is_sent_once() {
        let mut session = UpdateSession::new(settings("cat", &[]));
        session.start().await.unwrap();
        session
            .authenticate("example.org", "example.org", "c2VjcmV0")
            .await
            .unwrap();
        session
            .authenticate("example.org", "example.org", "c2VjcmV0")
            .await
            .unwrap();

        let echoed = session.close().await.unwrap();
        assert_eq!(
            echoed,
            "server ns.example.org\n\
             zone example.org.\n\
             key hmac-sha256:ddns-key.example.org c2VjcmV0\n\
             quit\n"
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_batch_shares_one_authentication_and_one_send() {
        let mut session = UpdateSession::new(settings("cat", &[]));
        session.start().await.unwrap();

        let first = record(Action::Update);
        let second = RecordRequest {
            fqdn: "bar.example.org".to_string(),
            domain: "bar".to_string(),
            ..record(Action::Delete)
        };
        session.apply(&first).await.unwrap();
        session.apply(&second).await.unwrap();
        assert_eq!(session.state(), SessionState::PendingCommit);

        let echoed = session.close().await.unwrap();
        let lines: Vec<&str> = echoed.lines().collect();
        assert_eq!(
            lines,
            vec![
                "server ns.example.org",
                "zone example.org.",
                "key hmac-sha256:ddns-key.example.org c2VjcmV0",
                "update delete foo.example.org A",
                "update add foo.example.org 300 A 1.2.3.4",
                "update delete bar.example.org A",
                "send",
                "quit",
            ]
        );
        assert_eq!(session.transcript(), lines.as_slice());
    }

    #[tokio::test]
    async fn test_no_zone_or_key_lines_when_empty() {
        let mut session = UpdateSession::new(settings("cat", &[]));
        session.start().await.unwrap();
        let req = RecordRequest {
            zone: String::new(),
            key_name: String::new(),
            record_type: RecordType::Txt,
            value: "hello world".to_string(),
            ..record(Action::Update)
        };
        session.update_record(&req).await.unwrap();

        let echoed = session.close().await.unwrap();
        assert_eq!(
            echoed,
            "server ns.example.org\n\
             update delete foo.example.org TXT\n\
             update add foo.example.org 300 TXT \"hello world\"\n\
             send\n\
             quit\n"
        );
    }

    #[tokio::test]
    async fn test_failing_close_reports_status_and_stderr() {
        let mut session = UpdateSession::new(settings(
            "sh",
            &["-c", "cat > /dev/null; echo 'update failed: REFUSED' >&2; exit 2"],
        ));
        session.start().await.unwrap();
        session.delete_record(&record(Action::Delete)).await.unwrap();

        let err = session.close().await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("exit status"), "{}", message);
        assert!(message.ends_with(": update failed: REFUSED\n"), "{}", message);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_clean_exit_with_stderr_is_a_failure() {
        let mut session = UpdateSession::new(settings(
            "sh",
            &["-c", "cat > /dev/null; echo 'warning: bad key' >&2"],
        ));
        session.start().await.unwrap();
        session.update_record(&record(Action::Update)).await.unwrap();

        let err = session.close().await.unwrap_err();
        assert_eq!(err.to_string(), "warning: bad key");
    }

    #[tokio::test]
    async fn test_quiet_program_returns_empty_output() {
        let mut session = UpdateSession::new(settings("sh", &["-c", "cat > /dev/null"]));
        session.start().await.unwrap();
        session.update_record(&record(Action::Update)).await.unwrap();
        assert_eq!(session.close().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut session = UpdateSession::new(settings("/nonexistent/nsupdate", &[]));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, DdnsError::Spawn(_)));
        assert_eq!(session.state(), SessionState::NotStarted);
    }

    #[tokio::test]
    async fn test_disallowed_transitions() {
        let mut session = UpdateSession::new(settings("cat", &[]));
        assert!(matches!(
            session.authenticate("", "", "").await,
            Err(DdnsError::InvalidTransition { .. })
        ));
        assert!(matches!(
            session.delete_record(&record(Action::Delete)).await,
            Err(DdnsError::InvalidTransition { .. })
        ));
        assert!(session.close().await.is_err());

        session.start().await.unwrap();
        assert!(matches!(
            session.start().await,
            Err(DdnsError::InvalidTransition { .. })
        ));
        session.close().await.unwrap();
        assert!(matches!(
            session.close().await,
            Err(DdnsError::InvalidTransition { .. })
        ));
        assert!(session.update_record(&record(Action::Update)).await.is_err());
    }
}
