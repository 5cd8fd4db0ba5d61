use std::error::Error;

use fshttpstream_sdk::{SessionEvent, StreamOptions, StreamSession};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // connect_stream [host] [port] [filter...]
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.next().unwrap_or_default();
    let filters: Vec<String> = args.collect();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let options = StreamOptions::new(host)
            .with_port(port)
            .with_filters(filters);
        let mut session = StreamSession::connect(options)?;
        println!(
            "connecting mode={} url={}",
            session.client().mode_label(),
            session.client().url()
        );

        while let Some(event) = session.recv().await {
            match event {
                SessionEvent::Opened => {
                    println!("subscribed filters={:?}", session.client().filters());
                }
                SessionEvent::Ping => {}
                SessionEvent::Event(headers) => {
                    println!(
                        "event={} uuid={}",
                        headers.event_name().unwrap_or("-"),
                        headers.unique_id().unwrap_or("-"),
                    );
                }
                SessionEvent::Closed => println!("disconnected"),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
