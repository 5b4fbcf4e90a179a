//! Dials a running verse server, walks the full two-stage handshake and
//! reports every event the core delivers, until the session terminates.

use clap::{App, Arg};
use std::net::ToSocketAddrs;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempo::logging;
use verse::cmd::{FakeCmd, InCmd};
use verse::session::{DataSignal, Session, SessionHandle};
use verse::stream::client::ClientConfig;
use verse::stream::worker as stream_worker;
use verse::url::{UrlPort, VerseUrl};

fn main() {
    let matches = App::new("Verse Probe")
        .version("0.1.0")
        .about("Connects to a verse server and reports session events.")
        .arg(Arg::with_name("URL").help("verse-<tp>-<sec>://host:port").required(true))
        .arg(Arg::with_name("USERNAME").required(true))
        .arg(Arg::with_name("PASSWORD").required(true))
        .arg(
            Arg::with_name("debug")
                .short("d")
                .value_name("LEVEL")
                .default_value("info"),
        )
        .get_matches();

    let log = logging::init(matches.value_of("debug").unwrap_or("info"));

    let url = match VerseUrl::parse(matches.value_of("URL").unwrap()) {
        Ok(url) => url,
        Err(_) => {
            logging::error!(log, "bad url"; "url" => matches.value_of("URL").unwrap());
            process::exit(1);
        }
    };

    let stream_port = match url.port {
        UrlPort::Number(port) => port,
        UrlPort::Any => verse::url::DEFAULT_PORT,
    };

    let server_addr = match format!("{}:{}", url.host, stream_port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
    {
        Some(addr) => addr,
        None => {
            logging::error!(log, "cannot resolve host"; "host" => &url.host);
            process::exit(1);
        }
    };

    let config = ClientConfig {
        username: matches.value_of("USERNAME").unwrap().to_owned(),
        password: matches.value_of("PASSWORD").unwrap().to_owned(),
        client_name: Some("probe".to_owned()),
        client_version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        requested_url: VerseUrl::new(url.transport, url.security, &url.host, UrlPort::Any),
    };

    let data_signal = Arc::new(DataSignal::new());
    let session = SessionHandle::shared(Session::new(1, &url.host), Arc::clone(&data_signal));

    // Event consumer: the probe's stand-in for a scene layer.
    {
        let session = Arc::clone(&session);
        let log = log.new(logging::o!("worker" => "events"));

        thread::spawn(move || loop {
            data_signal.wait(Duration::from_millis(500));

            let mut state = session.state.lock().expect("Session poisoned");

            while let Some(cmd) = state.in_queue.pop() {
                match cmd {
                    InCmd::Fake(FakeCmd::ConnectAccept { user_id, avatar_id }) => {
                        logging::info!(log, "connected";
                                       "user_id" => user_id,
                                       "avatar_id" => avatar_id);
                    }
                    InCmd::Fake(FakeCmd::ConnectTerminate { reason }) => {
                        logging::info!(log, "terminated"; "reason" => ?reason);
                        process::exit(0);
                    }
                    InCmd::Fake(other) => {
                        logging::debug!(log, "signal"; "cmd" => ?other);
                    }
                    InCmd::Node(node_cmd) => {
                        logging::info!(log, "node command";
                                       "cmd_id" => node_cmd.id,
                                       "addr" => format!("{:02x?}", node_cmd.addr),
                                       "data_len" => node_cmd.data.len());
                    }
                }
            }
        });
    }

    logging::info!(log, "dialing"; "server" => %server_addr);

    let result = stream_worker::client_loop(server_addr, session, config, 10, log.clone());

    match result {
        Ok(()) => logging::info!(log, "session finished"),
        Err(error) => {
            logging::error!(log, "session failed"; "error" => ?error);
            process::exit(1);
        }
    }
}
