//! Application callback invoked once per received request.
//!
//! The I/O core never looks at request bytes. Whatever sits behind
//! [`Handler`] decides the reply, so a real protocol engine can replace the
//! default fixed acknowledgment without touching the server.

use bytes::Bytes;

/// Acknowledgment sent by the default handler.
pub const PONG: &[u8] = b"+PONG\r\n";

/// Turns one received request into the bytes to send back.
///
/// The response must fit in a single buffer slice.
pub trait Handler: Send {
    fn handle(&self, request: &[u8]) -> Bytes;
}

impl<F> Handler for F
where
    F: Fn(&[u8]) -> Bytes + Send,
{
    fn handle(&self, request: &[u8]) -> Bytes {
        self(request)
    }
}

/// Replies with the same payload whatever the request contains.
#[derive(Debug, Clone)]
pub struct FixedReply {
    payload: Bytes,
}

impl FixedReply {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

impl Default for FixedReply {
    fn default() -> Self {
        Self::new(Bytes::from_static(PONG))
    }
}

impl Handler for FixedReply {
    fn handle(&self, _request: &[u8]) -> Bytes {
        self.payload.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_reply_ignores_input() {
        let handler = FixedReply::default();
        assert_eq!(&handler.handle(b"hello")[..], PONG);
        assert_eq!(&handler.handle(b"")[..], PONG);
        assert_eq!(&handler.handle(b"*1\r\n$4\r\nPING\r\n")[..], PONG);
    }

    #[test]
    fn test_closure_handler() {
        let echo = |request: &[u8]| Bytes::copy_from_slice(request);
        assert_eq!(&echo.handle(b"abc")[..], b"abc");
    }
}
