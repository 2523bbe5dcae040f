//! TCP server for murmur clients.
//!
//! The acceptor thread owns the listening socket and starts one session
//! thread per accepted connection. Sessions and execution workers share a
//! single `Context` holding the client directory, the command queue and the
//! handlers.

use crate::config::Config;
use crate::directory::ClientDirectory;
use crate::executor;
use crate::handlers::{Handlers, SocialHandlers};
use crate::protocol::Command;
use crate::queue::BoundedQueue;
use crate::session;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// State shared by every session and worker, built once at startup.
pub struct Context {
    pub directory: ClientDirectory,
    pub queue: BoundedQueue<Command>,
    pub handlers: Box<dyn Handlers>,
    /// Upper bound of the random processing delay, when enabled.
    pub max_delay: Option<Duration>,
}

impl Context {
    pub fn new(config: &Config) -> Self {
        Self::with_handlers(
            config,
            Box::new(SocialHandlers::new(config.timeline_max, config.max_clients)),
        )
    }

    pub fn with_handlers(config: &Config, handlers: Box<dyn Handlers>) -> Self {
        Self {
            directory: ClientDirectory::new(config.max_clients),
            queue: BoundedQueue::new(config.queue_capacity),
            handlers,
            max_delay: config
                .random_delay
                .then(|| Duration::from_micros(config.max_delay_us)),
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
    ctx: Arc<Context>,
    listener: TcpListener,
}

impl Server {
    /// Bind the listening socket and build the shared context.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr = config
            .listen_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "listen address did not resolve")
            })?;
        let listener = create_listener(addr, config.backlog)?;
        let ctx = Arc::new(Context::new(&config));

        Ok(Server {
            config,
            ctx,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the execution pool and accept connections forever.
    pub fn run(self) -> io::Result<()> {
        info!(
            address = %self.local_addr()?,
            max_clients = self.ctx.directory.capacity(),
            queue_capacity = self.ctx.queue.capacity(),
            random_delay = self.config.random_delay,
            "Server listening"
        );

        let _workers = executor::spawn_workers(&self.ctx, self.config.workers)?;

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let ctx = Arc::clone(&self.ctx);
                    let spawned = thread::Builder::new()
                        .name(format!("session-{addr}"))
                        .spawn(move || session::run(ctx, stream));

                    if let Err(e) = spawned {
                        error!(peer = %addr, error = %e, "Failed to create session thread");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Get a handle on the shared state for testing
    #[cfg(test)]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

/// Create a blocking listener with address reuse and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LineReader;
    use crate::directory::ClientRecord;
    use crate::handlers::{HandlerError, HandlerResult};
    use crate::protocol::{client_key, parse, Reply};
    use parking_lot::Mutex;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Instant;

    struct Client {
        stream: TcpStream,
        reader: LineReader<TcpStream>,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            let reader = LineReader::new(stream.try_clone().unwrap(), 4096);
            Self { stream, reader }
        }

        fn send(&mut self, line: &str) {
            self.stream.write_all(format!("{line}\n").as_bytes()).unwrap();
        }

        /// Next reply line, `None` once the server closed the connection.
        fn recv(&mut self) -> Option<String> {
            let line = self.reader.read_line().ok()??;
            Some(String::from_utf8(line.to_vec()).unwrap().trim_end().to_string())
        }

        fn login(addr: SocketAddr, name: &str) -> Self {
            let mut client = Self::connect(addr);
            client.send(&format!("LOGIN {name}"));
            assert_eq!(
                client.recv().unwrap(),
                format!("registered {name} {}", client_key(name))
            );
            client
        }
    }

    fn start(config: Config) -> (SocketAddr, Arc<Context>) {
        let server = Server::bind(Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..config
        })
        .unwrap();
        let addr = server.local_addr().unwrap();
        let ctx = Arc::clone(server.context());
        thread::spawn(move || server.run());
        (addr, ctx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_server_creation() {
        let server = Server::bind(Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        })
        .unwrap();
        assert!(server.context().directory.is_empty());
        assert_eq!(server.context().queue.capacity(), 5);
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_login_duplicate_and_relogin() {
        let (addr, ctx) = start(Config::default());
        let key = client_key("alice");

        let first = Client::login(addr, "alice");

        let mut second = Client::connect(addr);
        second.send("LOGIN alice");
        assert_eq!(second.recv(), None);
        assert_eq!(ctx.directory.len(), 1);

        drop(first);
        wait_until(|| ctx.directory.lookup(key).is_none());

        let mut third = Client::login(addr, "alice");
        third.send("FOLLOW_COUNT");
        assert_eq!(third.recv().unwrap(), "followers 0");
    }

    #[test]
    fn test_first_line_must_be_login() {
        let (addr, ctx) = start(Config::default());

        let mut client = Client::connect(addr);
        client.send("TIMELINE");
        assert_eq!(client.recv(), None);
        assert!(ctx.directory.is_empty());
    }

    #[test]
    fn test_parse_error_keeps_session() {
        let (addr, _ctx) = start(Config::default());

        let mut client = Client::login(addr, "carol");
        client.send("TIMELINE please");
        assert_eq!(client.recv().unwrap(), "error: TIMELINE takes no argument");
        client.send("JUMP");
        assert_eq!(client.recv().unwrap(), "error: unknown command: JUMP");
        client.send("RDV");
        assert_eq!(client.recv().unwrap(), "rdv_ack");
    }

    #[test]
    fn test_follow_and_timeline() {
        let (addr, _ctx) = start(Config::default());

        let mut alice = Client::login(addr, "alice");
        let mut bob = Client::login(addr, "bob");

        alice.send("FOLLOW bob");
        assert_eq!(alice.recv().unwrap(), "following bob");
        bob.send("PUBLISH hello from bob");
        assert!(bob.recv().unwrap().starts_with("published "));
        bob.send("FOLLOW_COUNT");
        assert_eq!(bob.recv().unwrap(), "followers 1");

        alice.send("TIMELINE");
        assert_eq!(alice.recv().unwrap(), "timeline 1");
        let entry = alice.recv().unwrap();
        assert!(entry.starts_with("bob "));
        assert!(entry.ends_with(": hello from bob"));
    }

    #[test]
    fn test_capacity_limit() {
        let (addr, _ctx) = start(Config {
            max_clients: 1,
            ..Config::default()
        });

        let _alice = Client::login(addr, "alice");
        let mut bob = Client::connect(addr);
        bob.send("LOGIN bob");
        assert_eq!(bob.recv(), None);
    }

    #[test]
    fn test_oversized_line_ends_session() {
        let (addr, ctx) = start(Config::default());

        let mut client = Client::login(addr, "dave");
        client.send(&format!("PUBLISH {}", "x".repeat(400)));
        wait_until(|| ctx.directory.is_empty());
    }

    #[test]
    fn test_single_worker_executes_in_queue_order() {
        let (addr, _ctx) = start(Config {
            workers: 1,
            queue_capacity: 1,
            ..Config::default()
        });

        let publishers: Vec<_> = ["erin", "frank"]
            .into_iter()
            .map(|name| {
                thread::spawn(move || {
                    let mut client = Client::login(addr, name);
                    for i in 0..20 {
                        client.send(&format!("PUBLISH {name} {i}"));
                    }
                    client.send("RDV");

                    let mut seqs = Vec::new();
                    for _ in 0..20 {
                        let reply = client.recv().unwrap();
                        let seq: u64 = reply
                            .strip_prefix("published ")
                            .unwrap()
                            .parse()
                            .unwrap();
                        seqs.push(seq);
                    }
                    assert_eq!(client.recv().unwrap(), "rdv_ack");
                    seqs
                })
            })
            .collect();

        let mut all = Vec::new();
        for publisher in publishers {
            let seqs = publisher.join().unwrap();
            // Each client's publications ran in the order they were sent.
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 40);
    }

    /// Social handlers that log every publication in execution order.
    struct Recording {
        inner: SocialHandlers,
        executed: Arc<Mutex<Vec<String>>>,
    }

    impl Handlers for Recording {
        fn login(&self, cmd: Command) -> Result<(Arc<ClientRecord>, Reply), HandlerError> {
            self.inner.login(cmd)
        }

        fn publish(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
            self.executed.lock().push(cmd.payload.clone());
            self.inner.publish(cmd, directory)
        }

        fn follow(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
            self.inner.follow(cmd, directory)
        }

        fn timeline(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
            self.inner.timeline(cmd, directory)
        }

        fn follow_count(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
            self.inner.follow_count(cmd, directory)
        }

        fn rdv(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
            self.inner.rdv(cmd, directory)
        }

        fn unregister(&self, cmd: &Command, directory: &ClientDirectory) -> HandlerResult {
            self.inner.unregister(cmd, directory)
        }
    }

    #[test]
    fn test_single_worker_follows_global_arrival_order() {
        let config = Config {
            workers: 1,
            queue_capacity: 1,
            ..Config::default()
        };
        let executed = Arc::new(Mutex::new(Vec::new()));
        let ctx = Arc::new(Context::with_handlers(
            &config,
            Box::new(Recording {
                inner: SocialHandlers::new(config.timeline_max, config.max_clients),
                executed: Arc::clone(&executed),
            }),
        ));
        let _workers = executor::spawn_workers(&ctx, config.workers).unwrap();

        // Producers log each enqueue under one lock, so `enqueued` is the
        // exact order commands entered the queue.
        let enqueued = Arc::new(Mutex::new(Vec::new()));
        let producers: Vec<_> = ["erin", "frank"]
            .into_iter()
            .map(|name| {
                let ctx = Arc::clone(&ctx);
                let enqueued = Arc::clone(&enqueued);
                thread::spawn(move || {
                    let key = client_key(name);
                    for i in 0..20 {
                        let line = format!("S1 {name}-{i}");
                        let cmd = parse(line.as_bytes(), key).unwrap();
                        let mut order = enqueued.lock();
                        order.push(cmd.payload.clone());
                        ctx.queue.enqueue(cmd);
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        wait_until(|| executed.lock().len() == 40);
        assert_eq!(*executed.lock(), *enqueued.lock());
    }
}
