//! Execution pool.
//!
//! Each worker loops forever: take the oldest command from the queue, run
//! the matching handler, and write the reply straight to the issuing
//! client's socket. Nothing flows back to the session that queued the
//! command. A failing command is logged and dropped; the worker moves on.
//!
//! With more than one worker, two commands from the same client may execute
//! out of order. Only their order of arrival in the queue is guaranteed.

use crate::directory::DirectoryError;
use crate::handlers::{HandlerError, HandlerResult};
use crate::protocol::{Command, CommandKind, Reply};
use crate::server::Context;
use rand::Rng;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Start `count` workers draining the command queue of `ctx`.
pub fn spawn_workers(ctx: &Arc<Context>, count: usize) -> io::Result<Vec<JoinHandle<()>>> {
    info!(workers = count, "Starting execution pool");

    let mut handles = Vec::with_capacity(count);
    for worker_id in 0..count {
        let ctx = Arc::clone(ctx);
        let handle = thread::Builder::new()
            .name(format!("executor-{worker_id}"))
            .spawn(move || worker_loop(worker_id, &ctx))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(worker_id: usize, ctx: &Context) {
    debug!(worker = worker_id, "Worker started");

    loop {
        let cmd = ctx.queue.dequeue();
        trace!(worker = worker_id, kind = %cmd.kind, key = cmd.origin_key, "Dequeued command");
        execute(ctx, cmd);
    }
}

/// Run one command and deliver its reply, if any.
pub fn execute(ctx: &Context, cmd: Command) {
    let reply = match process(ctx, &cmd) {
        Ok(reply) => reply,
        Err(e) => {
            if is_missing_client(&e) {
                warn!(kind = %cmd.kind, key = cmd.origin_key, error = %e, "Command for a missing client");
            } else {
                error!(kind = %cmd.kind, key = cmd.origin_key, error = %e, "Failed to run command");
            }
            return;
        }
    };

    if let Some(reply) = reply {
        if cmd.reply_expected {
            deliver(ctx, &reply);
        }
    }
}

/// A client removed before its command ran; the directory already warned.
fn is_missing_client(e: &HandlerError) -> bool {
    matches!(e, HandlerError::Directory(DirectoryError::NotFound(_)))
}

/// Dispatch a command to its handler.
pub fn process(ctx: &Context, cmd: &Command) -> HandlerResult {
    let handlers = ctx.handlers.as_ref();
    let directory = &ctx.directory;

    match cmd.kind {
        // Logins are run by the session; one reaching the pool is a repeat.
        CommandKind::Login => Err(HandlerError::AlreadyLoggedIn(cmd.origin_key)),
        CommandKind::Publish => {
            maybe_delay(ctx);
            handlers.publish(cmd, directory)
        }
        CommandKind::Follow => {
            maybe_delay(ctx);
            handlers.follow(cmd, directory)
        }
        CommandKind::Timeline => {
            maybe_delay(ctx);
            handlers.timeline(cmd, directory)
        }
        CommandKind::FollowCount => handlers.follow_count(cmd, directory),
        CommandKind::Rdv => handlers.rdv(cmd, directory),
        CommandKind::Unregister => handlers.unregister(cmd, directory),
    }
}

/// Send a reply to the client it is addressed to.
fn deliver(ctx: &Context, reply: &Reply) {
    let Some(client) = ctx.directory.lookup(reply.key) else {
        warn!(key = reply.key, "Reply for a client that is gone");
        return;
    };

    if let Err(e) = client.connection.send_reply(reply) {
        warn!(name = %client.name, key = reply.key, error = %e, "Unable to answer client");
    }
}

fn maybe_delay(ctx: &Context) {
    if let Some(max) = ctx.max_delay {
        let micros = rand::thread_rng().gen_range(0..max.as_micros().max(1) as u64);
        thread::sleep(Duration::from_micros(micros));
    }
}
