mod config;
mod users;

use clap::{App, Arg};
use config::ServerConfig;
use mio::net::{TcpListener, UdpSocket};
use signal_hook::consts::{SIGINT, SIGUSR1};
use signal_hook::iterator::Signals;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempo::logging::{self, Logger};
use users::UserDb;
use verse::cmd::{FakeCmd, InCmd};
use verse::error::{ErrorType, NetworkError, NetworkResult, TerminateReason};
use verse::registry::{self, PortPool, SessionRegistry};
use verse::session::{Session, SharedSession};
use verse::stream::server::StreamHost;
use verse::url::{UrlPort, VerseUrl};
use verse::{dgram, stream, AvatarId, UserId};

/// Everything the per-session workers need from the process.
struct ServerApp {
    config: ServerConfig,
    users: UserDb,
    port_pool: Arc<Mutex<PortPool>>,
    shutdown: AtomicBool,
    log: Logger,
}

impl StreamHost for ServerApp {
    fn check_auth(&self, username: &str, password: &str) -> Option<(UserId, AvatarId)> {
        self.users.check(username, password)
    }

    fn ded(&self) -> String {
        self.config.auth.ded.clone()
    }

    fn hostname(&self) -> String {
        self.config.server.hostname.clone()
    }

    fn provision(
        &self,
        session: &SharedSession,
        state: &mut Session,
        requested: &VerseUrl,
    ) -> NetworkResult<VerseUrl> {
        let port = self
            .port_pool
            .lock()
            .expect("Port pool poisoned")
            .allocate()
            .ok_or(NetworkError::Fatal(ErrorType::ServerFull))?;

        let bind_addr: SocketAddr = format!("{}:{}", self.config.server.address, port).parse()?;

        let socket = match UdpSocket::bind(&bind_addr) {
            Ok(socket) => socket,
            Err(error) => {
                self.port_pool.lock().expect("Port pool poisoned").free(port);
                return Err(error.into());
            }
        };

        let worker_session = Arc::clone(session);
        let worker_log = self
            .log
            .new(logging::o!("worker" => "dgram", "session_id" => state.id, "port" => port));
        let max_attempts = self.config.server.max_connection_attempts;
        let mtu = self.config.data.mtu;

        // The port returns to the pool on every exit path of the worker,
        // including a handshake that never completes.
        let pool = Arc::clone(&self.port_pool);

        thread::Builder::new()
            .name(format!("dgram-{}", state.id))
            .spawn(move || {
                let result =
                    dgram::worker::server_loop(socket, worker_session, mtu, max_attempts, worker_log.clone());
                if let Err(error) = result {
                    logging::warn!(worker_log, "datagram worker failed"; "error" => ?error);
                }
                pool.lock().expect("Port pool poisoned").free(port);
            })
            .map_err(|error| NetworkError::Fatal(ErrorType::Io(error.kind())))?;

        Ok(VerseUrl::new(
            requested.transport,
            requested.security,
            &self.config.server.hostname,
            UrlPort::Number(port),
        ))
    }
}

fn main() {
    let matches = App::new("Verse Server")
        .version("0.1.0")
        .about("Serves shared scene state over the verse protocol.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .value_name("CONFIG_FILE")
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .value_name("LEVEL")
                .possible_values(&["none", "info", "warning", "error", "debug"])
                .default_value("info")
                .help("Debug print level"),
        )
        .get_matches();

    let log = logging::init(matches.value_of("debug").unwrap_or("info"));

    let config = match matches.value_of("config") {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                logging::error!(log, "failed to load configuration";
                                "path" => path,
                                "error" => %error);
                process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let users = match UserDb::load(&config.auth.users_file) {
        Ok(users) => users,
        Err(error) => {
            logging::error!(log, "failed to load user database";
                            "path" => &config.auth.users_file,
                            "error" => %error);
            process::exit(1);
        }
    };

    logging::info!(log, "user database loaded"; "users" => users.len());

    let listen_addr: SocketAddr =
        match format!("{}:{}", config.server.address, config.server.port).parse() {
            Ok(addr) => addr,
            Err(error) => {
                logging::error!(log, "bad listen address"; "error" => %error);
                process::exit(1);
            }
        };

    let listener = match TcpListener::bind(&listen_addr) {
        Ok(listener) => listener,
        Err(error) => {
            logging::error!(log, "failed to bind listener";
                            "address" => %listen_addr,
                            "error" => %error);
            process::exit(1);
        }
    };

    logging::info!(log, "listening"; "address" => %listen_addr);

    let port_pool = PortPool::new(config.server.port_low, config.port_high());
    let max_sessions = usize::from(config.server.max_sessions);
    let users_file = config.auth.users_file.clone();

    let app = Arc::new(ServerApp {
        config,
        users,
        port_pool: Arc::new(Mutex::new(port_pool)),
        shutdown: AtomicBool::new(false),
        log: log.clone(),
    });

    let registry = Arc::new(Mutex::new(SessionRegistry::new(max_sessions)));
    let data_signal = registry.lock().expect("Registry poisoned").data_signal();

    // Signals land on a dedicated thread so the workers never see EINTR.
    {
        let app = Arc::clone(&app);
        let registry = Arc::clone(&registry);
        let log = log.new(logging::o!("worker" => "signals"));

        let mut signals = match Signals::new(&[SIGINT, SIGUSR1]) {
            Ok(signals) => signals,
            Err(error) => {
                logging::error!(log, "failed to install signal handlers"; "error" => %error);
                process::exit(1);
            }
        };

        thread::Builder::new()
            .name("signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGINT => {
                            logging::info!(log, "interrupt received, closing sessions");
                            app.shutdown.store(true, Ordering::SeqCst);

                            for session in registry.lock().expect("Registry poisoned").active() {
                                let mut state = session.state.lock().expect("Session poisoned");
                                state.out_queue.push_fake(FakeCmd::ConnectTerminate {
                                    reason: TerminateReason::Server,
                                });
                            }
                            return;
                        }
                        SIGUSR1 => match app.users.reload(&users_file) {
                            Ok(count) => {
                                logging::info!(log, "user database reloaded"; "users" => count)
                            }
                            Err(error) => {
                                logging::warn!(log, "user database reload failed"; "error" => %error)
                            }
                        },
                        _ => (),
                    }
                }
            })
            .expect("Failed to spawn signal thread");
    }

    // The data thread drains every ready session's incoming queue and
    // dispatches to the scene layer.
    {
        let app = Arc::clone(&app);
        let registry = Arc::clone(&registry);
        let signal = Arc::clone(&data_signal);
        let log = log.new(logging::o!("worker" => "data"));

        thread::Builder::new()
            .name("data".to_owned())
            .spawn(move || loop {
                signal.wait(Duration::from_millis(500));

                if app.shutdown.load(Ordering::SeqCst) {
                    return;
                }

                for session in registry.lock().expect("Registry poisoned").active() {
                    let mut state = session.state.lock().expect("Session poisoned");

                    while let Some(cmd) = state.in_queue.pop() {
                        match cmd {
                            InCmd::Fake(FakeCmd::ConnectAccept { user_id, avatar_id }) => {
                                logging::info!(log, "session connected";
                                               "session_id" => state.id,
                                               "user_id" => user_id,
                                               "avatar_id" => avatar_id);
                            }
                            InCmd::Fake(FakeCmd::ConnectTerminate { reason }) => {
                                logging::info!(log, "session terminated";
                                               "session_id" => state.id,
                                               "reason" => ?reason);
                            }
                            InCmd::Fake(_) => (),
                            InCmd::Node(node_cmd) => {
                                // Scene handling lives outside the core.
                                logging::debug!(log, "node command";
                                                "session_id" => state.id,
                                                "cmd_id" => node_cmd.id,
                                                "addr_len" => node_cmd.addr.len(),
                                                "data_len" => node_cmd.data.len());
                            }
                        }
                    }
                }
            })
            .expect("Failed to spawn data thread");
    }

    // The acceptor owns the main thread.
    let accept_result = registry::acceptor_loop(
        listener,
        &registry,
        &app.shutdown,
        &log,
        |id, session, tcp_stream, peer| {
            {
                let mut state = session.state.lock().expect("Session poisoned");
                state.fps_host = app.config.data.fps;
            }

            let host: Arc<dyn StreamHost + Send + Sync> = app.clone();
            let registry = Arc::clone(&registry);
            let worker_log = log.new(logging::o!("worker" => "stream", "session_id" => id));

            let spawned = thread::Builder::new()
                .name(format!("stream-{}", id))
                .spawn(move || {
                    let result = stream::worker::server_loop(
                        tcp_stream,
                        Arc::clone(&session),
                        host,
                        worker_log.clone(),
                    );

                    if let Err(error) = result {
                        logging::warn!(worker_log, "stream worker failed";
                                       "peer" => %peer,
                                       "error" => ?error);
                    }

                    registry.lock().expect("Registry poisoned").release(id);
                });

            if spawned.is_err() {
                logging::error!(log, "failed to spawn stream worker"; "session_id" => id);
            }
        },
    );

    if let Err(error) = accept_result {
        logging::error!(log, "acceptor failed"; "error" => ?error);
        process::exit(1);
    }

    logging::info!(log, "server stopped");
}
