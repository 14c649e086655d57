static EVENT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

fn main() {
    env_logger::init();

    let host = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1".to_string());

    let config = kcpnet::Config {
        timeout_ms: 4_000,
        ..Default::default()
    };

    let mut client = kcpnet::Client::with_config(config);

    client
        .connect(&host, 8888)
        .expect("failed to create kcpnet client");

    let mut counter: u32 = 0;

    while client.is_connected() {
        let reliable = format!("reliable {}", counter);
        let unreliable = format!("unreliable {}", counter);
        counter += 1;

        let _ = client.send(reliable.as_bytes(), kcpnet::Channel::Reliable);
        let _ = client.send(unreliable.as_bytes(), kcpnet::Channel::Unreliable);

        while let Some(event) = client.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                kcpnet::ClientEvent::Connect => {
                    println!("client::Event::Connect");
                }
                kcpnet::ClientEvent::Disconnect => {
                    println!("client::Event::Disconnect");
                }
                kcpnet::ClientEvent::Receive(message, channel) => {
                    println!(
                        "client::Event::Receive {:?} {}",
                        channel,
                        String::from_utf8_lossy(&message)
                    );
                }
                kcpnet::ClientEvent::Error(kind, reason) => {
                    println!("client::Event::Error {:?}: {}", kind, reason);
                }
            }
        }
    }
}
