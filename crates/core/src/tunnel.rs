//! The callback contract every chain stage implements.

use crate::chain::Chain;
use crate::line::{LineId, Signal, WorkerId};

/// Outcome of a textual control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResult {
    Ok(String),
    Error(String),
}

/// A stage in a tunnel chain.
///
/// Upstream callbacks carry events arriving from the previous stage, and
/// downstream callbacks carry events arriving from the next stage. A tunnel
/// must ignore callbacks for lines it does not (or no longer) track.
pub trait Tunnel: Send {
    fn name(&self) -> &'static str;

    /// Called once before any other callback.
    fn on_start(&mut self, _chain: &mut Chain) {}

    /// Called when a timer scheduled with [`Chain::schedule`] fires.
    fn on_timer(&mut self, _chain: &mut Chain, _wid: WorkerId, _token: u64) {}

    fn upstream_init(&mut self, chain: &mut Chain, line: LineId);
    fn upstream_est(&mut self, chain: &mut Chain, line: LineId);
    fn upstream_finish(&mut self, chain: &mut Chain, line: LineId);
    fn upstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: bytes::BytesMut);
    fn upstream_pause(&mut self, chain: &mut Chain, line: LineId);
    fn upstream_resume(&mut self, chain: &mut Chain, line: LineId);

    fn downstream_init(&mut self, chain: &mut Chain, line: LineId);
    fn downstream_est(&mut self, chain: &mut Chain, line: LineId);
    fn downstream_finish(&mut self, chain: &mut Chain, line: LineId);
    fn downstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: bytes::BytesMut);
    fn downstream_pause(&mut self, chain: &mut Chain, line: LineId);
    fn downstream_resume(&mut self, chain: &mut Chain, line: LineId);

    /// Handle a control request. Unknown requests are an error.
    fn api(&mut self, request: &[u8]) -> ApiResult {
        ApiResult::Error(format!("{}: unsupported request ({} bytes)", self.name(), request.len()))
    }

    /// Dispatch a signal that arrived from the previous stage.
    fn upstream(&mut self, chain: &mut Chain, line: LineId, signal: Signal) {
        match signal {
            Signal::Init => self.upstream_init(chain, line),
            Signal::Est => self.upstream_est(chain, line),
            Signal::Finish => self.upstream_finish(chain, line),
            Signal::Payload(buf) => self.upstream_payload(chain, line, buf),
            Signal::Pause => self.upstream_pause(chain, line),
            Signal::Resume => self.upstream_resume(chain, line),
        }
    }

    /// Dispatch a signal that arrived from the next stage.
    fn downstream(&mut self, chain: &mut Chain, line: LineId, signal: Signal) {
        match signal {
            Signal::Init => self.downstream_init(chain, line),
            Signal::Est => self.downstream_est(chain, line),
            Signal::Finish => self.downstream_finish(chain, line),
            Signal::Payload(buf) => self.downstream_payload(chain, line, buf),
            Signal::Pause => self.downstream_pause(chain, line),
            Signal::Resume => self.downstream_resume(chain, line),
        }
    }
}
