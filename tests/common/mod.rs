use std::sync::mpsc;
use std::thread;
use std::time;

pub static EVENT_TIMEOUT: time::Duration = time::Duration::from_millis(1000);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// IPv4 loopback configuration with an otherwise default setup.
pub fn config() -> kcpnet::Config {
    kcpnet::Config {
        dual_mode: false,
        ..Default::default()
    }
}

/// Runs `f` with a server bound to an ephemeral port on a new thread, and returns the port along
/// with the join handle.
pub fn spawn_server<F>(config: kcpnet::Config, f: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(kcpnet::Server) + Send + 'static,
{
    let (port_tx, port_rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let server =
            kcpnet::Server::bind_with_config(0, config).expect("failed to create kcpnet server");

        port_tx.send(server.local_addr().port()).unwrap();

        f(server);
    });

    let port = port_rx.recv().expect("server thread failed to start");

    (port, handle)
}

/// Connects a client to the loopback server at `port` and waits for the handshake to complete.
pub fn connect(config: kcpnet::Config, port: u16) -> kcpnet::Client {
    let mut client = kcpnet::Client::with_config(config);

    client
        .connect("127.0.0.1", port)
        .expect("failed to create kcpnet client");

    match client.wait_event_timeout(EVENT_TIMEOUT) {
        Some(kcpnet::ClientEvent::Connect) => {}
        other => panic!("expected ClientEvent::Connect, got {:?}", other),
    }

    client
}

/// Waits for the next client event, panicking on timeout.
pub fn next_event(client: &mut kcpnet::Client) -> kcpnet::ClientEvent {
    client
        .wait_event_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for client event")
}
