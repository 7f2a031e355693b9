use bytes::{Bytes, BytesMut};

/// A decoded unit of application data. The default codec treats the whole
/// readable buffer as one frame (`spec.md` §3: "codec (frame codec; default
/// = passthrough)").
pub type Frame = Bytes;

/// Framing strategy applied by `loopRead`/`loopWrite`. Implementations must
/// not block and must be safe to call repeatedly with partial input — they
/// run on the owning loop's thread only.
pub trait Codec: Send + Sync {
    /// Attempt to carve one frame out of `buf`. Returns `None` when the
    /// buffer doesn't yet hold a complete frame; implementations should
    /// leave `buf` untouched in that case.
    fn decode(&self, buf: &mut BytesMut) -> Option<Frame>;

    /// Append the wire representation of `frame` to `out`.
    fn encode(&self, frame: Frame, out: &mut BytesMut) {
        out.extend_from_slice(&frame);
    }
}

/// Default codec: every readable byte is one frame, delivered as soon as
/// it arrives. This matches `spec.md`'s "passthrough" default; it performs
/// no buffering of partial frames.
#[derive(Debug, Default)]
pub struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn decode(&self, buf: &mut BytesMut) -> Option<Frame> {
        if buf.is_empty() {
            return None;
        }
        Some(buf.split().freeze())
    }
}
