//! Data channels the device itself serves.
//!
//! A client opens `coap` to issue requests against the device's request
//! handlers and `stream-<port>` to read a device byte stream. Older clients
//! use the `nabto-` prefixed labels. Every other label belongs to the
//! application.

pub mod coap;
pub mod stream;

pub use coap::CoapBridge;
pub use stream::StreamBridge;

const COAP_LABELS: [&str; 2] = ["coap", "nabto-coap"];
const STREAM_PREFIXES: [&str; 2] = ["stream-", "nabto-stream-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRoute {
    Coap,
    Stream(u32),
    Application,
}

impl ChannelRoute {
    pub fn classify(label: &str) -> ChannelRoute {
        if COAP_LABELS.contains(&label) {
            return ChannelRoute::Coap;
        }
        for prefix in STREAM_PREFIXES {
            if let Some(port) = label.strip_prefix(prefix) {
                return match port.parse() {
                    Ok(port) => ChannelRoute::Stream(port),
                    Err(_) => {
                        tracing::warn!(%label, "stream channel with invalid port");
                        ChannelRoute::Application
                    }
                };
            }
        }
        ChannelRoute::Application
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_label() {
        assert_eq!(ChannelRoute::classify("coap"), ChannelRoute::Coap);
        assert_eq!(ChannelRoute::classify("nabto-coap"), ChannelRoute::Coap);
        assert_eq!(ChannelRoute::classify("stream-655"), ChannelRoute::Stream(655));
        assert_eq!(ChannelRoute::classify("nabto-stream-4000000000"), ChannelRoute::Stream(4_000_000_000));
        assert_eq!(ChannelRoute::classify("chat"), ChannelRoute::Application);
        assert_eq!(ChannelRoute::classify("coap2"), ChannelRoute::Application);
    }

    #[test]
    fn bad_stream_port_is_an_application_channel() {
        assert_eq!(ChannelRoute::classify("stream-"), ChannelRoute::Application);
        assert_eq!(ChannelRoute::classify("stream-http"), ChannelRoute::Application);
    }
}
