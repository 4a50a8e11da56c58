//! Host-facing tap devices, one per switch port.

use std::sync::Arc;

use basebox_types::MacAddress;

use crate::error::Result;

/// A virtual interface carrying frames between the kernel and a switch port.
pub trait TapDevice: Send + Sync {
    fn devname(&self) -> &str;

    fn ifindex(&self) -> u32;

    /// Hands `frame` to the kernel side of the device.
    fn enqueue(&self, frame: &[u8]) -> Result<()>;
}

/// Called with every frame the kernel transmits on a tap device.
pub type FrameHandler = Arc<dyn Fn(&dyn TapDevice, &[u8]) + Send + Sync>;

/// Creates and owns tap devices.
pub trait TapManager: Send + Sync {
    /// Creates `devname`, or returns the existing device of that name.
    fn create(&self, devname: &str, hwaddr: MacAddress) -> Result<Arc<dyn TapDevice>>;

    fn destroy(&self, devname: &str) -> Result<()>;

    fn get(&self, devname: &str) -> Option<Arc<dyn TapDevice>>;

    /// Installs the receive path; frames read before this are dropped.
    fn set_frame_handler(&self, handler: FrameHandler);
}

#[cfg(target_os = "linux")]
pub use linux::{LinuxTap, LinuxTapManager};

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::Arc;

    use basebox_types::MacAddress;
    use nix::errno::Errno;
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    use parking_lot::RwLock;
    use tokio::io::unix::AsyncFd;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, instrument, trace, warn};

    use super::{FrameHandler, TapDevice, TapManager};
    use crate::error::{BaseboxError, Result};

    const TUNSETIFF: libc::c_ulong = 0x400454ca;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct IfReq {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    fn ifname(name: &str) -> Result<[libc::c_char; libc::IFNAMSIZ]> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(BaseboxError::Tap(format!("invalid device name '{}'", name)));
        }
        let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
        for (dst, src) in out.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(out)
    }

    fn tap_err(devname: &str, what: &str, err: impl std::fmt::Display) -> BaseboxError {
        BaseboxError::Tap(format!("{}: {}: {}", devname, what, err))
    }

    /// Sets the MAC address and brings the interface up.
    fn configure(devname: &str, hwaddr: MacAddress) -> Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(tap_err(devname, "control socket", io::Error::last_os_error()));
        }

        let result = (|| {
            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            ifr.ifr_name = ifname(devname)?;

            if !hwaddr.is_zero() {
                unsafe {
                    ifr.ifr_ifru.ifru_hwaddr.sa_family = libc::ARPHRD_ETHER;
                    for (dst, src) in ifr.ifr_ifru.ifru_hwaddr.sa_data.iter_mut().zip(hwaddr.as_bytes()) {
                        *dst = *src as libc::c_char;
                    }
                }
                if unsafe { libc::ioctl(sock, libc::SIOCSIFHWADDR as libc::Ioctl, &ifr) } < 0 {
                    return Err(tap_err(devname, "set hwaddr", io::Error::last_os_error()));
                }
            }

            if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS as libc::Ioctl, &mut ifr) } < 0 {
                return Err(tap_err(devname, "get flags", io::Error::last_os_error()));
            }
            unsafe {
                ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
            }
            if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS as libc::Ioctl, &ifr) } < 0 {
                return Err(tap_err(devname, "set up", io::Error::last_os_error()));
            }
            Ok(())
        })();

        unsafe { libc::close(sock) };
        result
    }

    /// A non-persistent tap backed by `/dev/net/tun`; the device disappears
    /// when the last handle is dropped.
    pub struct LinuxTap {
        devname: String,
        ifindex: u32,
        fd: AsyncFd<OwnedFd>,
        stop: CancellationToken,
    }

    impl LinuxTap {
        #[instrument]
        fn open(devname: &str, hwaddr: MacAddress) -> Result<Self> {
            let fd = open(
                "/dev/net/tun",
                OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .map_err(|e| tap_err(devname, "open /dev/net/tun", e))?;

            let ifr = IfReq {
                ifr_name: ifname(devname)?,
                ifr_flags: IFF_TAP | IFF_NO_PI,
                _pad: [0; 22],
            };
            if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as libc::Ioctl, &ifr) } < 0 {
                return Err(tap_err(devname, "TUNSETIFF", io::Error::last_os_error()));
            }

            configure(devname, hwaddr)?;
            let ifindex = nix::net::if_::if_nametoindex(devname)
                .map_err(|e| tap_err(devname, "ifindex", e))?;

            Ok(Self {
                devname: devname.to_string(),
                ifindex,
                fd: AsyncFd::new(fd).map_err(|e| tap_err(devname, "async fd", e))?,
                stop: CancellationToken::new(),
            })
        }

        async fn read_loop(self: Arc<Self>, handler: Arc<RwLock<Option<FrameHandler>>>, mtu: usize) {
            let mut buf = vec![0u8; mtu];
            loop {
                let mut guard = tokio::select! {
                    _ = self.stop.cancelled() => break,
                    guard = self.fd.readable() => match guard {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!(tap = %self.devname, error = %e, "tap not readable");
                            break;
                        }
                    },
                };

                match guard.try_io(|fd| nix::unistd::read(fd.get_ref(), &mut buf).map_err(io::Error::from)) {
                    Ok(Ok(0)) => break,
                    Ok(Ok(len)) => {
                        let handler = handler.read().clone();
                        match handler {
                            Some(handler) => handler(&*self, &buf[..len]),
                            None => trace!(tap = %self.devname, len, "no frame handler, dropped"),
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(tap = %self.devname, error = %e, "tap read failed");
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
            debug!(tap = %self.devname, "tap reader stopped");
        }
    }

    impl TapDevice for LinuxTap {
        fn devname(&self) -> &str {
            &self.devname
        }

        fn ifindex(&self) -> u32 {
            self.ifindex
        }

        fn enqueue(&self, frame: &[u8]) -> Result<()> {
            match nix::unistd::write(self.fd.get_ref(), frame) {
                Ok(_) => Ok(()),
                Err(Errno::EAGAIN) => Err(tap_err(&self.devname, "write", "queue full")),
                Err(e) => Err(BaseboxError::Io(io::Error::from(e))),
            }
        }
    }

    /// Creates taps and runs one reader task per device on the current
    /// tokio runtime.
    pub struct LinuxTapManager {
        buffer_size: usize,
        taps: RwLock<HashMap<String, Arc<LinuxTap>>>,
        handler: Arc<RwLock<Option<FrameHandler>>>,
    }

    impl LinuxTapManager {
        pub fn new(buffer_size: usize) -> Self {
            Self {
                buffer_size,
                taps: RwLock::new(HashMap::new()),
                handler: Arc::new(RwLock::new(None)),
            }
        }
    }

    impl TapManager for LinuxTapManager {
        fn create(&self, devname: &str, hwaddr: MacAddress) -> Result<Arc<dyn TapDevice>> {
            if let Some(tap) = self.taps.read().get(devname) {
                return Ok(Arc::clone(tap) as Arc<dyn TapDevice>);
            }

            let tap = Arc::new(LinuxTap::open(devname, hwaddr)?);
            self.taps.write().insert(devname.to_string(), Arc::clone(&tap));
            tokio::spawn(Arc::clone(&tap).read_loop(Arc::clone(&self.handler), self.buffer_size));
            info!(tap = %devname, ifindex = tap.ifindex, "tap created");
            Ok(tap)
        }

        fn destroy(&self, devname: &str) -> Result<()> {
            let tap = self
                .taps
                .write()
                .remove(devname)
                .ok_or_else(|| BaseboxError::port_not_found(devname))?;
            tap.stop.cancel();
            info!(tap = %devname, "tap destroyed");
            Ok(())
        }

        fn get(&self, devname: &str) -> Option<Arc<dyn TapDevice>> {
            self.taps
                .read()
                .get(devname)
                .map(|tap| Arc::clone(tap) as Arc<dyn TapDevice>)
        }

        fn set_frame_handler(&self, handler: FrameHandler) {
            *self.handler.write() = Some(handler);
        }
    }

}
