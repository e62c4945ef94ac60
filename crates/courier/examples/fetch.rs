//! Fetch a URL, or download it to a file, continuing a partial download.
//!
//! Run with: cargo run -p courier --example fetch -- <url> [output-file]
//!
//! Set `RUST_LOG=courier=debug` to see session and transport events.

use courier::http::HttpMethod;
use courier::session::{Session, TaskHandlers};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: fetch <url> [output-file]");
        std::process::exit(2);
    };
    let output = args.next();

    let session = Session::builder().build().expect("Failed to create session");
    let (done_tx, done_rx) = oneshot::channel();
    let handlers = TaskHandlers::new()
        .on_download_progress(|progress| {
            if let Some(percent) = progress.snapshot().percent() {
                eprint!("\r{percent:3}%");
            }
        })
        .on_completion(move |result| {
            let _ = done_tx.send(result);
        });

    let task = match &output {
        Some(path) => {
            let request = session
                .request_serializer()
                .build(&url, HttpMethod::Get)
                .expect("Invalid URL");
            let task = session
                .download_task_to_file(request, path, handlers)
                .expect("Failed to create download");
            task.resume();
            task
        }
        None => session.get(&url, None, handlers).expect("Invalid URL"),
    };
    println!("Started task {}", task.id());

    match done_rx.await {
        Ok(Ok(decoded)) => {
            eprintln!();
            if let Some(path) = decoded.as_file() {
                println!("Saved to {}", path.display());
            } else if let Some(bytes) = decoded.as_bytes() {
                println!("Received {} bytes", bytes.len());
                println!("{}", String::from_utf8_lossy(&bytes[..bytes.len().min(512)]));
            }
        }
        Ok(Err(e)) => {
            eprintln!();
            eprintln!("Request failed: {}", e.message());
            eprintln!("{}", e.debug_description());
            std::process::exit(1);
        }
        Err(_) => eprintln!("Session stopped before the task completed"),
    }
}
