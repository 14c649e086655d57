static EVENT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

const PORT: u16 = 8888;

fn main() {
    env_logger::init();

    let config = kcpnet::Config {
        timeout_ms: 4_000,
        ..Default::default()
    };

    let mut server =
        kcpnet::Server::bind_with_config(PORT, config).expect("failed to create kcpnet server");

    println!("echoing on {}", server.local_addr());

    loop {
        while let Some(event) = server.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                kcpnet::ServerEvent::Connect(id) => {
                    println!(
                        "server::Event::Connect {} {:?}",
                        id,
                        server.connection_address(id)
                    );
                }
                kcpnet::ServerEvent::Disconnect(id) => {
                    println!("server::Event::Disconnect {}", id);
                }
                kcpnet::ServerEvent::Receive(id, message, channel) => {
                    println!("server::Event::Receive {} {:?} {:02X?}", id, channel, message);

                    let _ = server.send(id, &message, channel);
                }
                kcpnet::ServerEvent::Error(id, kind, reason) => {
                    println!("server::Event::Error {} {:?}: {}", id, kind, reason);
                }
            }
        }
    }
}
