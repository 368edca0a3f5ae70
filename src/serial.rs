/// Serial links for UART-attached sensors
use futures_util::future::{BoxFuture, FutureExt};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};

/// Both sensors power up at 9600 8N1
const DEFAULT_BAUD: u32 = 9600;

/// A bidirectional byte stream whose line speed can be set
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    fn set_baud_rate(&mut self, baud: u32) -> BoxFuture<'_, io::Result<()>>;
}

impl<S: SerialLink + ?Sized> SerialLink for Box<S> {
    fn set_baud_rate(&mut self, baud: u32) -> BoxFuture<'_, io::Result<()>> {
        (**self).set_baud_rate(baud)
    }
}

/// Open a tty as a raw 8N1 port without flow control
pub fn open_port(path: &Path) -> io::Result<SerialStream> {
    let port = tokio_serial::new(path.to_string_lossy(), DEFAULT_BAUD)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()?;
    Ok(port)
}

impl SerialLink for SerialStream {
    fn set_baud_rate(&mut self, baud: u32) -> BoxFuture<'_, io::Result<()>> {
        let result = SerialPort::set_baud_rate(self, baud).map_err(io::Error::from);
        async move { result }.boxed()
    }
}

#[cfg(test)]
impl SerialLink for tokio::io::DuplexStream {
    fn set_baud_rate(&mut self, _baud: u32) -> BoxFuture<'_, io::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_device_fails_to_open() {
        assert!(open_port(Path::new("/dev/does-not-exist-air-sensor")).is_err());
    }
}
