//! Interactive lock console
//!
//! Reads one command per line and routes lock operations through the home
//! region's leader forwarder:
//!
//! ```text
//! acquire <lock> <client> [timeout_ms]
//! release <lock> <client> <token>
//! extend <lock> <client> <token> [timeout_ms]
//! check <lock>
//! status
//! disconnect <region> | reconnect <region> | sync <region>
//! help | quit
//! ```

use fencelock_common::current_timestamp_ms;
use fencelock_core::model::{LockRequest, LockResponse};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::startup::LocalDeployment;

const HELP: &str = "\
commands:
  acquire <lock> <client> [timeout_ms]
  release <lock> <client> <token>
  extend <lock> <client> <token> [timeout_ms]
  check <lock>
  status
  disconnect <region>
  reconnect <region>
  sync <region>
  help
  quit";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a valid number")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Lock(LockRequest),
    Status,
    Disconnect(String),
    Reconnect(String),
    Sync(String),
    Help,
    Quit,
}

fn number(value: &str) -> Result<u64, CommandError> {
    value
        .parse()
        .map_err(|_| CommandError::InvalidNumber(value.to_string()))
}

impl Command {
    /// Parse one input line; blank lines yield `None`
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((name, args)) = words.split_first() else {
            return Ok(None);
        };

        let command = match (name.to_lowercase().as_str(), args) {
            ("acquire", [lock_id, client_id]) => Command::Lock(LockRequest::Acquire {
                lock_id: lock_id.to_string(),
                client_id: client_id.to_string(),
                timeout_ms: 0,
            }),
            ("acquire", [lock_id, client_id, timeout]) => Command::Lock(LockRequest::Acquire {
                lock_id: lock_id.to_string(),
                client_id: client_id.to_string(),
                timeout_ms: number(timeout)?,
            }),
            ("acquire", _) => return Err(CommandError::Usage("acquire <lock> <client> [timeout_ms]")),
            ("release", [lock_id, client_id, token]) => Command::Lock(LockRequest::Release {
                lock_id: lock_id.to_string(),
                client_id: client_id.to_string(),
                fencing_token: number(token)?,
            }),
            ("release", _) => return Err(CommandError::Usage("release <lock> <client> <token>")),
            ("extend", [lock_id, client_id, token, rest @ ..]) if rest.len() <= 1 => {
                Command::Lock(LockRequest::Extend {
                    lock_id: lock_id.to_string(),
                    client_id: client_id.to_string(),
                    fencing_token: number(token)?,
                    timeout_ms: rest.first().map(|t| number(t)).transpose()?.unwrap_or(0),
                })
            }
            ("extend", _) => {
                return Err(CommandError::Usage(
                    "extend <lock> <client> <token> [timeout_ms]",
                ));
            }
            ("check", [lock_id]) => Command::Lock(LockRequest::Check {
                lock_id: lock_id.to_string(),
            }),
            ("check", _) => return Err(CommandError::Usage("check <lock>")),
            ("status", []) => Command::Status,
            ("disconnect", [region]) => Command::Disconnect(region.to_string()),
            ("reconnect", [region]) => Command::Reconnect(region.to_string()),
            ("sync", [region]) => Command::Sync(region.to_string()),
            ("disconnect" | "reconnect" | "sync", _) => {
                return Err(CommandError::Usage("disconnect|reconnect|sync <region>"));
            }
            ("help", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            (other, _) => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

/// One-line rendering of a lock response
pub fn format_response(response: &LockResponse) -> String {
    let mut line = response.status.as_str().to_string();
    if let Some(lock) = &response.lock {
        line.push_str(&format!(
            " lock={} holder={} region={} token={}",
            lock.lock_id, lock.holder_id, lock.holder_region, lock.fencing_token
        ));
        if lock.expires_at > 0 {
            let remaining = (lock.expires_at - current_timestamp_ms()).max(0);
            line.push_str(&format!(" expires_in={}ms", remaining));
        }
    }
    if !response.is_ok() {
        line.push_str(&format!(": {}", response.message));
    }
    line
}

fn status_report(deployment: &LocalDeployment) -> String {
    let mut lines = Vec::new();
    for region in deployment.regions() {
        let marker = if region.region_id() == deployment.home_region() {
            "*"
        } else {
            " "
        };
        lines.push(format!("{} region {}", marker, region.region_id()));
        for node in region.nodes() {
            let raft = node.raft_metrics();
            let stats = node.lock_stats();
            lines.push(format!(
                "    {} {} term={} commit={} applied={} locks={} pending_votes={}{}",
                raft.node_id,
                raft.state,
                raft.current_term,
                raft.commit_index,
                raft.last_applied,
                stats.active_locks,
                node.quorum().pending_vote_count(),
                if node.is_running() { "" } else { " (stopped)" }
            ));
        }
    }
    lines.join("\n")
}

/// Execute one command; `None` ends the session
pub async fn execute(deployment: &LocalDeployment, command: Command) -> Option<String> {
    let output = match command {
        Command::Lock(request) => format_response(&deployment.forwarder().execute(request).await),
        Command::Status => status_report(deployment),
        Command::Disconnect(region) => {
            deployment.directory().disconnect(&region);
            format!("region {} disconnected", region)
        }
        Command::Reconnect(region) => {
            deployment.directory().reconnect(&region);
            format!("region {} reconnected", region)
        }
        Command::Sync(region) => {
            let Some(leader) = deployment.directory().leader(deployment.home_region()) else {
                return Some("no leader in home region".to_string());
            };
            match leader.quorum().sync_from_region(&region).await {
                Ok(installed) => format!("installed {} locks from {}", installed, region),
                Err(e) => format!("{}: {}", e.status().as_str(), e),
            }
        }
        Command::Help => HELP.to_string(),
        Command::Quit => return None,
    };
    Some(output)
}

/// Run the console until `quit` or end of input
pub async fn run<R, W>(deployment: &LocalDeployment, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(
            format!(
                "fencelock console, region {} ('help' for commands)\n",
                deployment.home_region()
            )
            .as_bytes(),
        )
        .await?;

    let mut lines = reader.lines();
    loop {
        writer.write_all(b"> ").await?;
        writer.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let output = match Command::parse(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => match execute(deployment, command).await {
                Some(output) => output,
                None => break,
            },
            Err(e) => e.to_string(),
        };
        writer.write_all(output.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}
