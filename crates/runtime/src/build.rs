use tracing::info;
use waterwall_core::Tunnel;
use waterwall_mux::{Concurrency, MuxClient, MuxError, MuxServer};
use waterwall_reverse::{ReverseClient, ReverseServer};
use waterwall_settings::{NodeKind, Settings};

use crate::Result;

/// Construct the tunnel a node file describes.
pub fn build_tunnel(settings: &Settings) -> Result<Box<dyn Tunnel>> {
    let opts = &settings.node.settings;
    let tunnel: Box<dyn Tunnel> = match settings.node.kind {
        NodeKind::MuxClient => {
            let mode = opts
                .mode
                .as_deref()
                .ok_or_else(|| MuxError::InvalidSettings("MuxClient requires a mode".into()))?;
            let concurrency = Concurrency::parse(mode, opts.connection_duration, opts.connection_capacity)?;
            Box::new(MuxClient::new(settings.workers, concurrency)?)
        }
        NodeKind::MuxServer => Box::new(MuxServer::new()),
        NodeKind::ReverseClient => Box::new(ReverseClient::new(settings.workers, opts.minimum_unused)?),
        NodeKind::ReverseServer => Box::new(ReverseServer::new(settings.workers)?),
    };
    info!("Built {} with {} workers", tunnel.name(), settings.workers);
    Ok(tunnel)
}
