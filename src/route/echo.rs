//! Echo route: returns every inbound frame to its sender.

use tracing::debug;

use super::{Route, RouteCtx};
use crate::error::GatewayError;
use crate::proto::FrameKind;

/// Stateless echo handler, mainly useful for smoke-testing clients.
#[derive(Debug, Default)]
pub struct EchoRoute;

impl EchoRoute {
    /// Boxed constructor matching the registry's provider signature.
    #[must_use]
    pub fn boxed() -> Box<dyn Route> {
        Box::new(Self)
    }
}

impl Route for EchoRoute {
    fn on_handshake(&mut self, ctx: &mut RouteCtx<'_>) {
        debug!(endpoint = ctx.endpoint, "echo route attached");
    }

    fn on_frame(
        &mut self,
        ctx: &mut RouteCtx<'_>,
        payload: &[u8],
        kind: FrameKind,
    ) -> Result<(), GatewayError> {
        ctx.send_frame(payload, kind)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::route::FrameSink;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<(Vec<u8>, FrameKind)>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&mut self, payload: &[u8], kind: FrameKind) -> Result<(), GatewayError> {
            self.sent.push((payload.to_vec(), kind));
            Ok(())
        }
    }

    #[test]
    fn echoes_payload_and_kind() {
        let mut sink = RecordingSink::default();
        let mut ctx = RouteCtx::new(1, None, &mut sink);
        let mut route = EchoRoute;
        route.on_frame(&mut ctx, b"ping me", FrameKind::String).unwrap();
        route.on_frame(&mut ctx, &[0x01, 0x02], FrameKind::Binary).unwrap();
        assert_eq!(
            sink.sent,
            vec![
                (b"ping me".to_vec(), FrameKind::String),
                (vec![0x01, 0x02], FrameKind::Binary),
            ]
        );
    }
}
