/// Byte link to the reader.
/// The inventory engine owns one of these exclusively; serial ports, pipes
/// and test doubles all plug in here.
pub trait RfidTransport: Send {
    /// Error type for transport operations
    type Error: std::fmt::Debug;

    /// Write a whole request frame
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read whatever arrived, waiting at most `timeout_ms`; `Ok(0)` means
    /// nothing arrived in time
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;

    /// Drop bytes received but not yet read
    fn clear_input(&mut self) -> Result<(), Self::Error>;
}
