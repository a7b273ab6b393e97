//! Serialization of buffered packets into poll-response bodies.
//!
//! Two client transports exist. Script-tag clients get one
//! `WebSocket.onmessage({...});` statement per packet inside a `<script>`
//! block. Clients that named a response variable (`jsid`) get a single
//! batched assignment `Response<jsid> = {"packets": [...]};` instead.

use serde::Serialize;

use super::Packet;

#[derive(Serialize)]
struct Batch<'a> {
    packets: &'a [Packet],
}

/// Renders packets for the transport the polling client asked for.
/// An empty slice renders a valid terminal body for either transport.
#[must_use]
pub fn render(packets: &[Packet], jsid: Option<&str>) -> String {
    match jsid {
        Some(jsid) => {
            let json = serde_json::to_string(&Batch { packets })
                .unwrap_or_else(|_| r#"{"packets":[]}"#.to_string());
            format!("Response{jsid} = {json};\n")
        }
        None => {
            let mut out = String::from("<script type=\"text/javascript\">");
            for packet in packets {
                if let Ok(json) = serde_json::to_string(packet) {
                    out.push_str("WebSocket.onmessage(");
                    out.push_str(&json);
                    out.push_str(");\n");
                }
            }
            out.push_str("</script>\n");
            out
        }
    }
}
