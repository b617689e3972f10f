use anyhow::Result;
use futures_util::StreamExt;

use forge_common::Event;

use crate::client::{send, ForgeClient};
use crate::output::print_event;

/// Incremental SSE decoder: feed it raw chunks, get back complete feed events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
    data: String,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &str) -> Vec<Event> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);

            if line.is_empty() {
                // Blank line ends one SSE message.
                if !self.data.is_empty() {
                    if let Ok(ev) = serde_json::from_str::<Event>(&self.data) {
                        out.push(ev);
                    }
                    self.data.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            }
            // id:, event: and keep-alive comments carry nothing the Event body lacks.
        }
        out
    }
}

pub async fn follow_events(client: &ForgeClient, since: Option<u64>) -> Result<()> {
    let mut req = client.get("/events/stream");
    if let Some(s) = since {
        req = req.query(&[("since", s)]);
    }
    let resp = send(req, "open event stream").await?;

    let mut decoder = SseDecoder::default();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for ev in decoder.push(&String::from_utf8_lossy(&chunk)) {
            print_event(&ev);
        }
    }
    eprintln!("✗ event stream closed by server");
    Ok(())
}
