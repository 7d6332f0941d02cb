//! `text/event-stream` rendering of bus events.
//!
//! The stream is written straight to the connection and flushed after every
//! event: first the replay window, then live events as they arrive, with a
//! comment line whenever the bus has been quiet for [`KEEP_ALIVE`].

use pinion_core::{shutdown_requested, Event, Orchestrator, Subscription};
use std::io::{self, Write};
use std::time::Duration;

pub const KEEP_ALIVE: Duration = Duration::from_secs(15);

const HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\r\n";

/// One SSE frame: the bus sequence number as `id`, the event kind as
/// `event`, and the JSON body as `data`.
pub fn format_event(event: &Event) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_owned());
    format!(
        "id: {}\nevent: {}\ndata: {data}\n\n",
        event.seq,
        event.kind.name()
    )
}

/// Write the response head and stream events until the client goes away,
/// the bus closes, or shutdown is requested.
pub fn stream_events(
    orch: &Orchestrator,
    mut subscription: Subscription,
    writer: &mut dyn Write,
    keep_alive: Duration,
) -> io::Result<()> {
    writer.write_all(HEAD)?;
    for event in subscription.take_replay() {
        writer.write_all(format_event(&event).as_bytes())?;
    }
    writer.flush()?;

    while !shutdown_requested() {
        let next = orch
            .runtime()
            .block_on(async { tokio::time::timeout(keep_alive, subscription.recv()).await });
        match next {
            Ok(Some(event)) => writer.write_all(format_event(&event).as_bytes())?,
            Ok(None) => break,
            Err(_) => writer.write_all(b": keep-alive\n\n")?,
        }
        writer.flush()?;
    }
    Ok(())
}
