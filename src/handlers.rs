//! Command handlers.
//!
//! The execution pool only knows the `Handlers` trait; `SocialHandlers` is
//! the microblogging implementation the server runs with. Handlers reach
//! client state exclusively through `ClientDirectory::lookup`, and take at
//! most one profile lock at a time.

use crate::directory::{ClientDirectory, ClientRecord, DirectoryError, Publication};
use crate::protocol::{client_key, Command, CommandKind, Reply};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Command handler errors
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("LOGIN command carries no connection")]
    MissingConnection,
    #[error("client {0} is not registered")]
    NotRegistered(u64),
    #[error("client {0} is already logged in")]
    AlreadyLoggedIn(u64),
    #[error("follow limit reached ({0})")]
    FollowLimit(usize),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Outcome of a handler: an optional reply for the issuing client.
pub type HandlerResult = Result<Option<Reply>, HandlerError>;

/// Semantics of each command kind.
pub trait Handlers: Send + Sync {
    /// Build the record of a client logging in, consuming the connection
    /// carried by `cmd`. Registration in the directory is left to the caller.
    fn login(&self, cmd: Command) -> Result<(Arc<ClientRecord>, Reply), HandlerError>;

    fn publish(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult;

    fn follow(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult;

    fn timeline(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult;

    fn follow_count(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult;

    fn rdv(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult;

    /// Remove the issuing client and close its connection.
    fn unregister(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult;
}

/// Publications, follow graph and timelines.
pub struct SocialHandlers {
    /// Next publication sequence number.
    seq: AtomicU64,
    /// Publications returned per timeline.
    timeline_max: usize,
    /// Clients one client may follow.
    max_follow: usize,
}

impl SocialHandlers {
    pub fn new(timeline_max: usize, max_follow: usize) -> Self {
        Self {
            seq: AtomicU64::new(1),
            timeline_max,
            max_follow,
        }
    }
}

fn origin(cmd: &Command, directory: &ClientDirectory) -> Result<Arc<ClientRecord>, HandlerError> {
    directory
        .lookup(cmd.origin_key)
        .ok_or(HandlerError::NotRegistered(cmd.origin_key))
}

impl Handlers for SocialHandlers {
    fn login(&self, cmd: Command) -> Result<(Arc<ClientRecord>, Reply), HandlerError> {
        let connection = cmd.connection.ok_or(HandlerError::MissingConnection)?;
        let record = Arc::new(ClientRecord::new(&cmd.payload, connection));

        info!(name = %record.name, key = record.key, peer = ?record.connection.peer(), "Client logged in");
        let reply = Reply::new(
            record.key,
            format!("registered {} {}", record.name, record.key),
        );
        Ok((record, reply))
    }

    fn publish(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
        let client = origin(cmd, directory)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        client.profile.lock().publications.push(Publication {
            seq,
            date: Utc::now(),
            body: cmd.payload.clone(),
        });

        debug!(name = %client.name, seq, "Published");
        Ok(Some(Reply::new(client.key, format!("published {seq}"))))
    }

    fn follow(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
        let client = origin(cmd, directory)?;
        let target_key = client_key(&cmd.payload);

        let Some(target) = directory.lookup(target_key) else {
            return Ok(Some(Reply::new(
                client.key,
                format!("unknown client {}", cmd.payload),
            )));
        };

        {
            let mut profile = client.profile.lock();
            if target.key == client.key || profile.followed.contains(&target.key) {
                return Ok(Some(Reply::new(
                    client.key,
                    format!("already following {}", target.name),
                )));
            }
            if profile.followed.len() >= self.max_follow {
                return Err(HandlerError::FollowLimit(self.max_follow));
            }
            profile.followed.push(target.key);
        }

        // An UNREGISTER of the target that removed it before our edge was
        // recorded has already scrubbed its followers; drop the edge here.
        let still_live = directory
            .lookup(target_key)
            .is_some_and(|live| Arc::ptr_eq(&live, &target));
        if !still_live {
            client.profile.lock().followed.retain(|&k| k != target_key);
            return Ok(Some(Reply::new(
                client.key,
                format!("unknown client {}", cmd.payload),
            )));
        }
        target.profile.lock().followers += 1;

        debug!(name = %client.name, target = %target.name, "Followed");
        Ok(Some(Reply::new(
            client.key,
            format!("following {}", target.name),
        )))
    }

    fn timeline(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
        let client = origin(cmd, directory)?;
        let followed = client.profile.lock().followed.clone();

        let mut entries = Vec::new();
        for key in std::iter::once(client.key).chain(followed) {
            // Followed clients may have left since.
            let Some(author) = directory.lookup(key) else {
                continue;
            };
            let profile = author.profile.lock();
            entries.extend(
                profile
                    .publications
                    .iter()
                    .map(|p| (author.name.clone(), p.clone())),
            );
        }

        let total = entries.len();
        entries.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));

        let mut body = format!("timeline {total}");
        for (author, publication) in entries.iter().take(self.timeline_max) {
            body.push_str(&format!(
                "\n{} {} {}: {}",
                author,
                publication.seq,
                publication.date.to_rfc3339(),
                publication.body
            ));
        }

        Ok(Some(Reply::new(client.key, body)))
    }

    fn follow_count(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
        let client = origin(cmd, directory)?;
        let followers = client.profile.lock().followers;
        Ok(Some(Reply::new(client.key, format!("followers {followers}"))))
    }

    fn rdv(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
        let client = origin(cmd, directory)?;
        Ok(Some(Reply::new(client.key, "rdv_ack")))
    }

    fn unregister(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
        debug_assert_eq!(cmd.kind, CommandKind::Unregister);
        let client = directory.remove(cmd.origin_key)?;
        client.connection.close();

        let followed = std::mem::take(&mut client.profile.lock().followed);
        for key in followed {
            if let Some(target) = directory.lookup(key) {
                let mut profile = target.profile.lock();
                profile.followers = profile.followers.saturating_sub(1);
            }
        }

        // Follow edges die with the record; a later LOGIN under the same
        // name starts with no followers.
        for follower in directory.snapshot() {
            follower.profile.lock().followed.retain(|&k| k != client.key);
        }

        info!(name = %client.name, key = client.key, "Client logged out");
        Ok(None)
    }
}
