//! TAP devices carrying point traffic into the host bridge.

use async_trait::async_trait;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::debug;

/// TAP device errors.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("Failed to open /dev/net/tun: {0}")]
    OpenTun(io::Error),

    #[error("Failed to create TAP device '{0}': {1}")]
    CreateDevice(String, io::Error),

    #[error("TAP name too long: {0} (max 15 chars)")]
    NameTooLong(String),

    #[error("Failed to set interface up: {0}")]
    SetUp(io::Error),

    #[error("TAP I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TAP device {0} is closed")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, TapError>;

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;

/// Read buffer large enough for any frame the device hands out.
pub const TAP_BUFFER: usize = 2048;

#[repr(C)]
#[derive(Default)]
struct IfReq {
    ifr_name: [u8; 16],
    ifr_flags: i16,
    _padding: [u8; 22],
}

/// A virtual interface the switch reads frames from and writes frames to.
#[async_trait]
pub trait Taper: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Wait for the next frame. Fails with [`TapError::Closed`] once closed.
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize>;

    async fn write_frame(&self, frame: &[u8]) -> Result<()>;

    /// Unblock readers and refuse further I/O.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Kernel TAP device. The interface disappears when the device is dropped.
pub struct TapDevice {
    name: String,
    fd: AsyncFd<OwnedFd>,
    closed: watch::Sender<bool>,
}

impl TapDevice {
    /// Create a TAP device. An empty name lets the kernel pick one.
    pub fn create(name: &str) -> Result<Self> {
        if name.len() > 15 {
            return Err(TapError::NameTooLong(name.to_string()));
        }

        let tun_fd = open(c"/dev/net/tun", OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| TapError::OpenTun(io::Error::from_raw_os_error(e as i32)))?;
        // Owned from here on so every error path closes it.
        let fd = unsafe { OwnedFd::from_raw_fd(tun_fd) };

        let mut ifreq = IfReq::default();
        ifreq.ifr_name[..name.len()].copy_from_slice(name.as_bytes());
        ifreq.ifr_flags = IFF_TAP | IFF_NO_PI;

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as libc::Ioctl, &mut ifreq) };
        if ret < 0 {
            return Err(TapError::CreateDevice(
                name.to_string(),
                io::Error::last_os_error(),
            ));
        }

        let len = ifreq.ifr_name.iter().position(|&b| b == 0).unwrap_or(15);
        let name = String::from_utf8_lossy(&ifreq.ifr_name[..len]).into_owned();
        let (closed, _) = watch::channel(false);
        let device = Self {
            name,
            fd: AsyncFd::new(fd)?,
            closed,
        };
        debug!(name = %device.name, "TAP device created");
        Ok(device)
    }

    /// Set the interface up.
    pub fn set_up(&self) -> Result<()> {
        set_interface_up(&self.name)
    }
}

/// Set an interface up by name.
pub fn set_interface_up(name: &str) -> Result<()> {
    if name.len() > 15 {
        return Err(TapError::NameTooLong(name.to_string()));
    }
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TapError::SetUp(io::Error::last_os_error()));
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };

    let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifreq.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as libc::Ioctl, &mut ifreq) };
    if ret < 0 {
        return Err(TapError::SetUp(io::Error::last_os_error()));
    }
    unsafe {
        ifreq.ifr_ifru.ifru_flags |= libc::IFF_UP as i16;
    }
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as libc::Ioctl, &ifreq) };
    if ret < 0 {
        return Err(TapError::SetUp(io::Error::last_os_error()));
    }
    Ok(())
}

async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

#[async_trait]
impl Taper for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let mut shutdown = self.closed.subscribe();
        loop {
            if *shutdown.borrow() {
                return Err(TapError::Closed(self.name.clone()));
            }
            let mut guard = tokio::select! {
                _ = closed(&mut shutdown) => continue,
                guard = self.fd.readable() => guard?,
            };
            match guard.try_io(|fd| {
                let ret = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(0)) => continue,
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TapError::Closed(self.name.clone()));
        }
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| {
                let ret = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
