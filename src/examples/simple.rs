//! Simple example of using resilient-fetch.
//!
//! Usage: `cargo run --example simple -- <youtube url or id> [language]`

use resilient_fetch::{FetchConfig, FetchService, RetryError, TranscriptFetch};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let video = args.next().unwrap_or_else(|| "dQw4w9WgXcQ".to_string());
    let language = args.next();

    println!("Starting fetch service...");
    let config = FetchConfig::builder()
        // free http proxy lists, one `host:port` per line
        .sources(vec![
            "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt",
            "https://cdn.jsdelivr.net/gh/TheSpeedX/PROXY-List@master/http.txt",
        ])
        .startup_delay(Duration::from_secs(1))
        .validation_batch_size(20)
        .max_attempts(3)
        .build();
    let service = FetchService::start(config)?;

    // give the maintainer a head start; fetches work without it through the direct path
    tokio::time::sleep(Duration::from_secs(30)).await;
    println!("Pool: {:?}", service.stats());

    let operation = TranscriptFetch::new(&video, language)?;
    match service.orchestrator().execute(&operation).await {
        Ok(transcript) => {
            println!("Language: {}", transcript.language);
            println!("{}", transcript.plain_text());
        }
        Err(RetryError::Permanent { cause, .. }) => println!("No transcript: {}", cause),
        Err(RetryError::Exhausted(failure)) if failure.all_blocked() => {
            println!("Every path was blocked: {}", failure)
        }
        Err(e) => println!("Fetch failed: {}", e),
    }

    service.shutdown().await;
    Ok(())
}
