use crate::error::DecodeError;
use canopy_hal::gpio::{EdgeSample, Level};
use std::time::Duration;

/// High pulses at least this long are a 1 bit.
const ONE_BIT_US: u32 = 50;
/// High pulses this long mean we lost an edge; the frame is spoiled.
const BAD_BIT_US: u32 = 200;
const DATA_BITS: i32 = 40;
/// The two high pulses before the data are the line release and the
/// sensor's response.
const HEADER_BITS: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtModel
{
    Dht11,
    /// Also sold as AM2302.
    Dht22
}

impl DhtModel
{
    pub fn from_tag(tag: &str) -> Option<Self>
    {
        match tag.trim().to_uppercase().as_str()
        {
            "DHT11" => Some(DhtModel::Dht11),
            "DHT22" | "AM2302" => Some(DhtModel::Dht22),
            _ => None
        }
    }

    /// How long the host holds the line low to wake the sensor.
    pub fn start_pulse(self) -> Duration
    {
        match self
        {
            DhtModel::Dht11 => Duration::from_millis(18),
            DhtModel::Dht22 => Duration::from_millis(17)
        }
    }

    fn convert(self, bytes: &[u8; 5]) -> DhtReading
    {
        match self
        {
            DhtModel::Dht11 => DhtReading { humidity: f64::from(bytes[0]), temperature: f64::from(bytes[2]) },
            DhtModel::Dht22 =>
            {
                let humidity = (u16::from(bytes[0]) << 8 | u16::from(bytes[1])) as f64 * 0.1;
                let raw = (u16::from(bytes[2] & 0x7F) << 8 | u16::from(bytes[3])) as f64 * 0.1;
                let temperature = if bytes[2] & 0x80 != 0 { -raw } else { raw };
                DhtReading { humidity, temperature }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DhtReading
{
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64
}

/// Failure counters kept across reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats
{
    pub bad_checksum: u32,
    pub short_message: u32,
    pub missing_message: u32,
    pub sensor_resets: u32
}

impl DecodeStats
{
    pub fn record(&mut self, result: &Result<DhtReading, DecodeError>)
    {
        match result
        {
            Ok(_) => {}
            Err(DecodeError::MissingMessage) => self.missing_message += 1,
            Err(DecodeError::ShortMessage(_)) => self.short_message += 1,
            Err(DecodeError::BadChecksum) => self.bad_checksum += 1
        }
    }
}

/// # FrameDecoder
/// Turns the transitions of one DHT transmission into bits. Every bit
/// is a ~50us low followed by a high whose length carries the value, so
/// a bit is complete on the falling edge that ends the high pulse. The
/// microsecond counter may wrap in the middle of a frame.
#[derive(Debug)]
pub struct FrameDecoder
{
    bit: i32,
    high_tick: Option<u32>,
    bytes: [u8; 5],
    spoiled: bool
}

impl FrameDecoder
{
    pub fn new() -> Self
    {
        FrameDecoder { bit: -HEADER_BITS, high_tick: None, bytes: [0; 5], spoiled: false }
    }

    pub fn feed(&mut self, sample: EdgeSample)
    {
        match sample.level
        {
            Level::High => self.high_tick = Some(sample.tick_us),
            Level::Low =>
            {
                if let Some(start) = self.high_tick.take()
                {
                    self.push_bit(sample.tick_us.wrapping_sub(start));
                }
            }
        }
    }

    fn push_bit(&mut self, high_us: u32)
    {
        if self.bit >= DATA_BITS
        {
            return;
        }
        if self.bit >= 0
        {
            if high_us >= BAD_BIT_US
            {
                self.spoiled = true;
            }
            let byte = &mut self.bytes[(self.bit / 8) as usize];
            *byte = (*byte << 1) | (high_us >= ONE_BIT_US) as u8;
        }
        self.bit += 1;
    }

    /// Data bits received so far.
    pub fn data_bits(&self) -> usize
    {
        self.bit.max(0) as usize
    }

    pub fn finish(&self, model: DhtModel) -> Result<DhtReading, DecodeError>
    {
        let bits = self.data_bits();
        if bits < 8
        {
            return Err(DecodeError::MissingMessage);
        }
        if bits < DATA_BITS as usize
        {
            return Err(DecodeError::ShortMessage(bits));
        }

        let sum = self.bytes[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if self.spoiled || sum != self.bytes[4]
        {
            return Err(DecodeError::BadChecksum);
        }
        Ok(model.convert(&self.bytes))
    }
}

pub fn decode(samples: &[EdgeSample], model: DhtModel) -> Result<DhtReading, DecodeError>
{
    let mut decoder = FrameDecoder::new();
    for sample in samples
    {
        decoder.feed(*sample);
    }
    decoder.finish(model)
}
