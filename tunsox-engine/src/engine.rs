//! Engine lifecycle
//!
//! The engine owns the device, the packet stack, the proxy and the remote
//! DNS interceptor while running. All operations serialize on one lock, so
//! `start` and `stop` never interleave.
//!
//! ```text
//!   Idle ──insert──▶ Configured ──start──▶ Running
//!    ▲                  │  ▲                  │
//!    │                  │  └──stop (partial)──┘ (start failed)
//!    └──────────────────┴──────stop───────────┘
//! ```

use std::sync::Arc;

use serde::Serialize;
use sox_dns::{
    parse_upstream, select_upstream, DnsInterceptor, ExchangerOptions, NameRecordCache,
    UpstreamExchanger,
};
use sox_stack::{Device, Stack, StackOptions, UdpForwarder};
use tokio::sync::Mutex;

use crate::config::Key;
use crate::device::{DeviceOpener, TunOpener};
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::proxy::{parse_proxy, Proxy};
use crate::restapi::{parse_restapi, RestApi};
use crate::stats::{EngineStats, StatsSource};
use crate::tunnel::Tunnel;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// No configuration
    Idle,
    /// Configuration inserted, not running
    Configured,
    /// Started successfully
    Running,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Configured => "configured",
            EngineState::Running => "running",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Inner {
    key: Option<Key>,
    running: bool,
    restapi: Option<RestApi>,
    proxy: Option<Arc<dyn Proxy>>,
    device: Option<Arc<dyn Device>>,
    stack: Option<Stack>,
    tunnel: Option<Arc<Tunnel>>,
    dns: Option<Arc<DnsInterceptor>>,
}

impl Inner {
    fn has_resources(&self) -> bool {
        self.restapi.is_some()
            || self.proxy.is_some()
            || self.device.is_some()
            || self.stack.is_some()
            || self.tunnel.is_some()
            || self.dns.is_some()
    }
}

/// Tunnel engine
pub struct Engine {
    inner: Mutex<Inner>,
    opener: Arc<dyn DeviceOpener>,
    stats: Arc<StatsSource>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine that opens TUN devices
    pub fn new() -> Self {
        Self::with_device_opener(Arc::new(TunOpener))
    }

    /// Create an engine with a custom device opener
    pub fn with_device_opener(opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            opener,
            stats: Arc::new(StatsSource::new()),
        }
    }

    /// Store the configuration used by the next [`Engine::start`]
    ///
    /// Rejected while running; stop the engine first.
    pub async fn insert(&self, key: Key) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Err(Error::AlreadyRunning);
        }
        inner.key = Some(key);
        Ok(())
    }

    pub async fn state(&self) -> EngineState {
        let inner = self.inner.lock().await;
        if inner.running {
            EngineState::Running
        } else if inner.key.is_some() {
            EngineState::Configured
        } else {
            EngineState::Idle
        }
    }

    /// Current statistics; empty while stopped
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Fake-IP record cache while remote DNS is active
    pub async fn name_cache(&self) -> Option<Arc<NameRecordCache>> {
        let inner = self.inner.lock().await;
        inner.dns.as_ref().map(|dns| dns.cache().clone())
    }

    /// Bring the engine up
    ///
    /// A failure leaves whatever was already set up in place; call
    /// [`Engine::stop`] to release it before starting again.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Err(Error::AlreadyRunning);
        }
        let key = inner.key.clone().ok_or(Error::NotConfigured)?;
        if inner.has_resources() {
            return Err(Error::InvalidState(
                "a previous start left resources behind, call stop first".into(),
            ));
        }

        let dialer = general(&key)?;
        self.rest_api(&key, &mut inner).await;
        self.netstack(&key, dialer, &mut inner).await?;

        inner.running = true;
        Ok(())
    }

    /// Tear everything down, best effort
    ///
    /// Every resource is released even if an earlier one fails to close; the
    /// first error is returned. Stopping an engine that never started is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut first_error: Option<Error> = None;

        if let Some(api) = inner.restapi.take() {
            api.stop().await;
            log::debug!("[RESTAPI] stopped");
        }

        if let Some(dns) = inner.dns.as_ref() {
            dns.disable();
        }

        if let Some(device) = inner.device.take() {
            if let Err(e) = device.close() {
                log::warn!("failed to close {}://{}: {}", device.kind(), device.name(), e);
                first_error.get_or_insert(Error::Io(e));
            }
        }

        if let Some(mut stack) = inner.stack.take() {
            stack.close();
            stack.wait().await;
            log::debug!("[STACK] stopped");
        }

        inner.tunnel.take();
        inner.proxy.take();
        inner.dns.take();
        self.stats.clear();

        if inner.running {
            inner.running = false;
            inner.key = None;
            log::info!("engine stopped");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn rest_api(&self, key: &Key, inner: &mut Inner) {
        let Some(ref restapi) = key.restapi else {
            return;
        };

        let target = match parse_restapi(restapi) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("[RESTAPI] failed to start: {}", e);
                return;
            }
        };

        match RestApi::start(&target, self.stats.clone()).await {
            Ok(api) => {
                log::info!("[RESTAPI] serve at: http://{}", api.local_addr());
                inner.restapi = Some(api);
            }
            Err(e) => log::warn!("[RESTAPI] failed to start: {}", e),
        }
    }

    async fn netstack(&self, key: &Key, dialer: Dialer, inner: &mut Inner) -> Result<()> {
        if key.proxy.trim().is_empty() {
            return Err(Error::Config("empty proxy".into()));
        }
        if key.device.trim().is_empty() {
            return Err(Error::Config("empty device".into()));
        }

        let proxy = parse_proxy(&key.proxy, dialer.clone())?;
        inner.proxy = Some(proxy.clone());

        let device = self.opener.open(&key.device, key.mtu).await?;
        inner.device = Some(device.clone());

        let mut options =
            StackOptions::default().with_tcp_moderate_receive_buffer(key.tcp_moderate_receive_buffer);
        if let Some(size) = key.send_buffer_size()? {
            options = options.with_tcp_send_buffer_size(size);
        }
        if let Some(size) = key.receive_buffer_size()? {
            options = options.with_tcp_receive_buffer_size(size);
        }

        let tunnel = Arc::new(Tunnel::new(proxy.clone(), key.effective_udp_timeout()));
        inner.tunnel = Some(tunnel.clone());

        let forwarder = Arc::new(UdpForwarder::new(tunnel.clone()));
        let stack = Stack::new(device.clone(), options)?;
        let handle = stack.handle();
        handle.set_udp_handler(forwarder.clone());
        handle.set_tcp_handler(tunnel.clone());
        inner.stack = Some(stack);

        self.stats.attach_stack(handle);
        self.stats.attach_tunnel(tunnel.clone());

        log::info!(
            "[STACK] {}://{} <-> {}://{}",
            device.kind(),
            device.name(),
            proxy.proto(),
            proxy.addr()
        );

        self.remote_dns(key, dialer, proxy.as_ref(), &forwarder, &tunnel, inner)
    }

    fn remote_dns(
        &self,
        key: &Key,
        dialer: Dialer,
        proxy: &dyn Proxy,
        forwarder: &UdpForwarder,
        tunnel: &Tunnel,
        inner: &mut Inner,
    ) -> Result<()> {
        let upstream = key
            .xpt_dns
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_upstream)
            .transpose()?;

        if !key.remote_dns {
            return Ok(());
        }
        if !proxy.proto().supports_remote_dns() {
            return Err(Error::Config(format!(
                "remote DNS not supported with {} proxy",
                proxy.proto()
            )));
        }

        let cache = Arc::new(
            NameRecordCache::new(&key.remote_dns_net_ipv4)?.with_ttl(key.effective_udp_timeout()),
        );
        let exchanger = UpstreamExchanger::with_binder(
            select_upstream(upstream),
            ExchangerOptions::default(),
            dialer.udp_binder(),
        );
        let interceptor = Arc::new(DnsInterceptor::new(cache.clone(), exchanger)?);

        forwarder.push_interceptor(interceptor.clone());
        tunnel.set_name_cache(Some(cache.clone()));
        self.stats.attach_names(cache.clone());
        interceptor.enable();
        inner.dns = Some(interceptor);

        log::info!(
            "[DNS] remote DNS enabled, fake-IP range {}",
            cache.pool().network()
        );
        Ok(())
    }
}

/// Apply logging and outbound socket settings
fn general(key: &Key) -> Result<Dialer> {
    log::set_max_level(key.log_level()?);

    let mut dialer = Dialer::new();
    if let Some(iface) = key.interface.as_deref().filter(|s| !s.is_empty()) {
        dialer = dialer.with_interface(iface)?;
        log::info!("[DIALER] bind to interface: {}", iface);
    }
    if key.fwmark != 0 {
        dialer = dialer.with_fwmark(key.fwmark);
        log::info!("[DIALER] set fwmark: {:#x}", key.fwmark);
    }

    if let Some(timeout) = key.udp_timeout()? {
        log::info!("[UDP] idle timeout: {:?}", timeout);
    }
    Ok(dialer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(proxy: &str) -> Key {
        Key {
            proxy: proxy.into(),
            device: "tun://tun9".into(),
            ..Key::default()
        }
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let engine = Engine::new();
        assert!(engine.stop().await.is_ok());
        assert!(engine.stop().await.is_ok());
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    #[tokio::test]
    async fn test_start_without_key() {
        let engine = Engine::new();
        assert!(matches!(engine.start().await, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn test_bad_proxy_leaves_configured() {
        let engine = Engine::new();
        engine.insert(key("quic://1.2.3.4:443")).await.unwrap();
        assert_eq!(engine.state().await, EngineState::Configured);

        assert!(matches!(engine.start().await, Err(Error::Proxy(_))));
        assert_eq!(engine.state().await, EngineState::Configured);

        engine.stop().await.unwrap();
        assert_eq!(engine.state().await, EngineState::Configured);
    }

    #[tokio::test]
    async fn test_bad_log_level_fails_general() {
        let engine = Engine::new();
        let mut k = key("direct://");
        k.loglevel = "chatty".into();
        engine.insert(k).await.unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&EngineState::Configured).unwrap(),
            "\"configured\""
        );
    }
}
