//! Virtual L3 interface (§4.5): the narrow platform-abstraction boundary
//! the runtime depends on instead of talking to `tun` directly, so tests
//! can substitute an in-memory double that exposes the packets the
//! runtime wrote and lets a test inject packets to be "read" back (§8,
//! "substitute an in-memory implementation that exposes
//! `written_packets`/`injectable_packets`").

use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AgentError, Result};

#[async_trait]
pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> &str;
    async fn set_ip(&self, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()>;
    async fn set_mtu(&self, mtu: u16) -> Result<()>;
    async fn up(&self) -> Result<()>;
    async fn down(&self) -> Result<()>;
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, buf: &[u8]) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}

/// Real implementation backed by the `tun` crate. One device per agent
/// process, created once in [`crate::runtime`]'s `InterfaceUp` step and
/// reused across `Rebuilding` cycles (§4.4 step 7: "keep the interface
/// up").
pub struct TunInterface {
    name: String,
    device: tokio::sync::Mutex<tun::AsyncDevice>,
}

impl TunInterface {
    pub fn new(name: &str, mtu: u16) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config.tun_name(name).mtu(mtu as i32).up();

        let device = tun::create_as_async(&config).map_err(|e| AgentError::Interface(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            device: tokio::sync::Mutex::new(device),
        })
    }
}

#[async_trait]
impl VirtualInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_ip(&self, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        let mut config = tun::Configuration::default();
        config.address(ip).netmask(netmask);
        self.device
            .lock()
            .await
            .configure(&config)
            .map_err(|e| AgentError::Interface(e.to_string()))
    }

    async fn set_mtu(&self, mtu: u16) -> Result<()> {
        let mut config = tun::Configuration::default();
        config.mtu(mtu as i32);
        self.device
            .lock()
            .await
            .configure(&config)
            .map_err(|e| AgentError::Interface(e.to_string()))
    }

    async fn up(&self) -> Result<()> {
        let mut config = tun::Configuration::default();
        config.up();
        self.device
            .lock()
            .await
            .configure(&config)
            .map_err(|e| AgentError::Interface(e.to_string()))
    }

    async fn down(&self) -> Result<()> {
        let mut config = tun::Configuration::default();
        config.down();
        self.device
            .lock()
            .await
            .configure(&config)
            .map_err(|e| AgentError::Interface(e.to_string()))
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        let mut device = self.device.lock().await;
        Ok(device.read(buf).await?)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        use tokio::io::AsyncWriteExt;
        let mut device = self.device.lock().await;
        Ok(device.write(buf).await?)
    }

    async fn close(&self) -> Result<()> {
        self.down().await
    }
}

/// In-memory double for tests (§8). `write` appends to `written_packets`;
/// `read` pops from `injectable_packets` if non-empty, else blocks
/// briefly returning `Ok(0)` so test loops can drain without spinning.
#[derive(Default)]
pub struct MemoryInterface {
    pub written_packets: Mutex<Vec<Vec<u8>>>,
    pub injectable_packets: Mutex<std::collections::VecDeque<Vec<u8>>>,
    pub up: Mutex<bool>,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, packet: Vec<u8>) {
        self.injectable_packets.lock().unwrap().push_back(packet);
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        "memtun0"
    }

    async fn set_ip(&self, _ip: Ipv4Addr, _netmask: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    async fn set_mtu(&self, _mtu: u16) -> Result<()> {
        Ok(())
    }

    async fn up(&self) -> Result<()> {
        *self.up.lock().unwrap() = true;
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        *self.up.lock().unwrap() = false;
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let next = self.injectable_packets.lock().unwrap().pop_front();
        match next {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(0)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.written_packets.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips_through_the_double() {
        let iface = MemoryInterface::new();
        iface.write(b"hello").await.unwrap();
        assert_eq!(iface.written_packets.lock().unwrap()[0], b"hello");

        iface.inject(b"world".to_vec());
        let mut buf = [0u8; 16];
        let n = iface.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn read_with_nothing_injected_returns_zero_without_erroring() {
        let iface = MemoryInterface::new();
        let mut buf = [0u8; 16];
        let n = iface.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
