//! The IPv6 tunnel device.
//!
//! Only a Linux implementation is provided; on other platforms the daemon
//! refuses to start. The relay engine itself is device-agnostic.

#[cfg(target_os = "linux")]
mod linux {
    use anyhow::{Context as _, Result};
    use std::ffi::{c_int, c_short};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    const TUN_FILE: &std::ffi::CStr = c"/dev/net/tun";
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    /// A control request addressed by interface name.
    ///
    /// The payload layout depends on the particular request.
    #[repr(C)]
    struct Request<P> {
        name: [u8; libc::IF_NAMESIZE],
        payload: P,
    }

    impl<P> Request<P> {
        fn new(name: &str, payload: P) -> Result<Self> {
            let bytes = name.as_bytes();
            anyhow::ensure!(
                bytes.len() < libc::IF_NAMESIZE,
                "interface name `{name}` is too long"
            );

            let mut name = [0u8; libc::IF_NAMESIZE];
            name[..bytes.len()].copy_from_slice(bytes);

            Ok(Self { name, payload })
        }
    }

    /// Executes `ioctl` on the given file descriptor.
    ///
    /// # Safety
    ///
    /// The file descriptor must be open and the payload layout must match
    /// what the request code expects.
    unsafe fn ioctl<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
        if unsafe { libc::ioctl(fd, code as _, req as *mut _) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub struct TunDevice {
        fd: AsyncFd<OwnedFd>,
        name: String,
    }

    impl TunDevice {
        /// Opens the `tun` device and attaches it to `name` (no packet
        /// information prefix, plain IP frames).
        pub fn create(name: &str) -> Result<Self> {
            let raw = unsafe { libc::open(TUN_FILE.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
            anyhow::ensure!(
                raw >= 0,
                "Failed to open {TUN_FILE:?}: {}",
                io::Error::last_os_error()
            );

            // Safety: we just opened this descriptor.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let mut request = Request::new(
                name,
                IffPayload {
                    flags: (libc::IFF_TUN | libc::IFF_NO_PI) as c_short,
                },
            )?;
            // Safety: `fd` is open and `IffPayload` matches TUNSETIFF.
            unsafe { ioctl(fd.as_raw_fd(), TUNSETIFF, &mut request) }
                .context("Failed to attach the tunnel interface (are we root?)")?;

            Ok(Self {
                fd: AsyncFd::new(fd)?,
                name: name.to_owned(),
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn set_mtu(&self, mtu: u16) -> Result<()> {
            let mut request = Request::new(
                &self.name,
                MtuPayload {
                    mtu: c_int::from(mtu),
                },
            )?;

            with_dgram_socket(|fd| {
                // Safety: `fd` is open and `MtuPayload` matches SIOCSIFMTU.
                unsafe { ioctl(fd, libc::SIOCSIFMTU, &mut request)? };

                Ok(())
            })
            .context("Failed to set tunnel MTU")
        }

        pub fn bring_up(&self) -> Result<()> {
            with_dgram_socket(|fd| {
                let mut request = Request::new(&self.name, FlagsPayload { flags: 0 })?;

                // Safety: `fd` is open and `FlagsPayload` matches SIOC*IFFLAGS.
                unsafe {
                    ioctl(fd, libc::SIOCGIFFLAGS, &mut request)?;
                    request.payload.flags |= libc::IFF_UP as c_short;
                    ioctl(fd, libc::SIOCSIFFLAGS, &mut request)?;
                }

                Ok(())
            })
            .context("Failed to bring the tunnel up")
        }

        pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.fd
                .async_io(Interest::READABLE, |fd| {
                    let n = unsafe {
                        libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                    };
                    if n < 0 {
                        return Err(io::Error::last_os_error());
                    }

                    Ok(n as usize)
                })
                .await
        }

        pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.fd
                .async_io(Interest::WRITABLE, |fd| {
                    let n =
                        unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
                    if n < 0 {
                        return Err(io::Error::last_os_error());
                    }

                    Ok(n as usize)
                })
                .await
        }
    }

    fn with_dgram_socket<T>(f: impl FnOnce(RawFd) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        anyhow::ensure!(
            raw >= 0,
            "Failed to open a control socket: {}",
            io::Error::last_os_error()
        );

        // Safety: we just opened this descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        f(fd.as_raw_fd())
    }

    #[repr(C)]
    struct IffPayload {
        flags: c_short,
    }

    #[repr(C)]
    struct MtuPayload {
        mtu: c_int,
    }

    #[repr(C)]
    struct FlagsPayload {
        flags: c_short,
    }
}

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use anyhow::Result;
    use std::io;

    pub struct TunDevice {}

    impl TunDevice {
        pub fn create(_name: &str) -> Result<Self> {
            anyhow::bail!("the IPv6 tunnel device is only implemented on Linux")
        }

        pub fn name(&self) -> &str {
            ""
        }

        pub fn set_mtu(&self, _mtu: u16) -> Result<()> {
            Ok(())
        }

        pub fn bring_up(&self) -> Result<()> {
            Ok(())
        }

        pub async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }

        pub async fn send(&self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::TunDevice;
