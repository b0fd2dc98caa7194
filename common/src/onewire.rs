//! Bit-banged 1-Wire master on a single open-drain line.
//!
//! Standard-speed slot timings. The timing-sensitive part of every slot (the low
//! pulse and, for reads, the sample point) runs inside a [`SlotGuard`], so the
//! scheduler can never stretch a pulse into the wrong symbol. Recovery gaps run
//! outside the guard; they only have a lower bound.

use core::fmt;

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};
use serde::{Deserialize, Serialize};

use crate::error::BusError;

pub const CMD_SKIP_ROM: u8 = 0xCC;
pub const CMD_MATCH_ROM: u8 = 0x55;
pub const CMD_CONVERT_T: u8 = 0x44;
pub const CMD_READ_SCRATCHPAD: u8 = 0xBE;

pub const SCRATCHPAD_LEN: usize = 9;
pub const MIN_VALID_C: f32 = -55.0;
pub const MAX_VALID_C: f32 = 125.0;

const RESET_LOW_US: u32 = 480;
const PRESENCE_SAMPLE_US: u32 = 70;
const RESET_RECOVERY_US: u32 = 410;
const WRITE_ONE_LOW_US: u32 = 6;
const WRITE_ONE_RECOVERY_US: u32 = 64;
const WRITE_ZERO_LOW_US: u32 = 60;
const WRITE_ZERO_RECOVERY_US: u32 = 10;
const READ_LOW_US: u32 = 6;
const READ_SAMPLE_US: u32 = 9;
const READ_RECOVERY_US: u32 = 55;

/// 64-bit ROM address of one device on the bus, least significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorIdentity(pub [u8; 8]);

impl SensorIdentity {
    pub fn family_code(&self) -> u8 {
        self.0[0]
    }

    pub fn has_valid_crc(&self) -> bool {
        crc8(&self.0[..7]) == self.0[7]
    }
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Runs one slot with preemption suppressed.
pub trait SlotGuard {
    fn run<R>(&mut self, slot: impl FnOnce() -> R) -> R;
}

/// Uses the platform's `critical-section` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CriticalSectionGuard;

impl SlotGuard for CriticalSectionGuard {
    fn run<R>(&mut self, slot: impl FnOnce() -> R) -> R {
        critical_section::with(|_| slot())
    }
}

/// Bus-wide operations the temperature acquisition sequence is built from.
pub trait TemperatureBus {
    /// Starts a conversion on every device at once.
    fn broadcast_convert(&mut self) -> Result<(), BusError>;

    /// Reads the last converted temperature of one device, in degrees Celsius.
    fn read_device(&mut self, identity: &SensorIdentity) -> Result<f32, BusError>;
}

pub struct OneWireBus<P, D, G = CriticalSectionGuard> {
    pin: P,
    delay: D,
    guard: G,
}

impl<P, D> OneWireBus<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(pin: P, delay: D) -> Self {
        Self::with_guard(pin, delay, CriticalSectionGuard)
    }
}

impl<P, D, G> OneWireBus<P, D, G>
where
    P: InputPin + OutputPin,
    D: DelayNs,
    G: SlotGuard,
{
    pub fn with_guard(pin: P, delay: D, guard: G) -> Self {
        Self { pin, delay, guard }
    }

    /// Issues a reset pulse and reports whether any device answered with presence.
    pub fn reset(&mut self) -> Result<bool, BusError> {
        let Self { pin, delay, guard } = self;

        pin.set_low().map_err(|_| BusError::Pin)?;
        delay.delay_us(RESET_LOW_US);
        let presence = guard.run(|| {
            pin.set_high().map_err(|_| BusError::Pin)?;
            delay.delay_us(PRESENCE_SAMPLE_US);
            pin.is_low().map_err(|_| BusError::Pin)
        })?;
        delay.delay_us(RESET_RECOVERY_US);

        Ok(presence)
    }

    pub fn write_bit(&mut self, bit: bool) -> Result<(), BusError> {
        let Self { pin, delay, guard } = self;
        let (low_us, recovery_us) = if bit {
            (WRITE_ONE_LOW_US, WRITE_ONE_RECOVERY_US)
        } else {
            (WRITE_ZERO_LOW_US, WRITE_ZERO_RECOVERY_US)
        };

        guard.run(|| {
            pin.set_low().map_err(|_| BusError::Pin)?;
            delay.delay_us(low_us);
            pin.set_high().map_err(|_| BusError::Pin)
        })?;
        delay.delay_us(recovery_us);
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool, BusError> {
        let Self { pin, delay, guard } = self;

        let bit = guard.run(|| {
            pin.set_low().map_err(|_| BusError::Pin)?;
            delay.delay_us(READ_LOW_US);
            pin.set_high().map_err(|_| BusError::Pin)?;
            delay.delay_us(READ_SAMPLE_US);
            pin.is_high().map_err(|_| BusError::Pin)
        })?;
        delay.delay_us(READ_RECOVERY_US);
        Ok(bit)
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), BusError> {
        for shift in 0..8 {
            self.write_bit((byte >> shift) & 0x01 == 0x01)?;
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, BusError> {
        let mut byte = 0_u8;
        for shift in 0..8 {
            if self.read_bit()? {
                byte |= 1 << shift;
            }
        }
        Ok(byte)
    }

    fn select(&mut self, identity: &SensorIdentity) -> Result<(), BusError> {
        if !self.reset()? {
            return Err(BusError::NotFound);
        }
        self.write_byte(CMD_MATCH_ROM)?;
        for byte in identity.0 {
            self.write_byte(byte)?;
        }
        Ok(())
    }
}

impl<P, D, G> TemperatureBus for OneWireBus<P, D, G>
where
    P: InputPin + OutputPin,
    D: DelayNs,
    G: SlotGuard,
{
    fn broadcast_convert(&mut self) -> Result<(), BusError> {
        if !self.reset()? {
            return Err(BusError::NotFound);
        }
        self.write_byte(CMD_SKIP_ROM)?;
        self.write_byte(CMD_CONVERT_T)
    }

    fn read_device(&mut self, identity: &SensorIdentity) -> Result<f32, BusError> {
        self.select(identity)?;
        self.write_byte(CMD_READ_SCRATCHPAD)?;

        let mut scratchpad = [0_u8; SCRATCHPAD_LEN];
        for byte in scratchpad.iter_mut() {
            *byte = self.read_byte()?;
        }

        decode_scratchpad(&scratchpad)
    }
}

/// Validates the scratchpad CRC and decodes the 1/16 degree fixed-point reading.
pub fn decode_scratchpad(scratchpad: &[u8; SCRATCHPAD_LEN]) -> Result<f32, BusError> {
    if crc8(&scratchpad[..SCRATCHPAD_LEN - 1]) != scratchpad[SCRATCHPAD_LEN - 1] {
        return Err(BusError::Checksum);
    }

    let raw = i16::from_le_bytes([scratchpad[0], scratchpad[1]]);
    let celsius = f32::from(raw) / 16.0;
    if !(MIN_VALID_C..=MAX_VALID_C).contains(&celsius) {
        return Err(BusError::OutOfRange(celsius));
    }
    Ok(celsius)
}

/// Dallas/Maxim CRC-8 (x^8 + x^5 + x^4 + 1, reflected).
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0_u8;
    for &byte in bytes {
        let mut data = byte;
        for _ in 0..8 {
            let mix = (crc ^ data) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            data >>= 1;
        }
    }
    crc
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{mock::*, *};

    const COIL: SensorIdentity =
        SensorIdentity([0x28, 0xBB, 0x88, 0xAF, 0x00, 0x00, 0x00, 0x27]);

    #[test]
    fn crc8_matches_reference_rom() {
        assert_eq!(crc8(&[0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00]), 0xA2);
        assert!(SensorIdentity([0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xA2]).has_valid_crc());
    }

    #[test]
    fn broadcast_convert_sends_skip_rom_then_convert() {
        let (pin, delay) = MockPin::pair();
        pin.script_presence_and_bytes(&[]);
        let line = pin.0.clone();
        let mut bus = OneWireBus::new(pin, delay);

        bus.broadcast_convert().unwrap();

        assert_eq!(
            line.borrow().written_transactions(),
            vec![vec![CMD_SKIP_ROM, CMD_CONVERT_T]]
        );
    }

    #[test]
    fn missing_presence_is_not_found() {
        let (pin, delay) = MockPin::pair();
        let mut bus = OneWireBus::new(pin, delay);

        assert_eq!(bus.broadcast_convert(), Err(BusError::NotFound));
        assert_eq!(bus.read_device(&COIL), Err(BusError::NotFound));
    }

    #[test]
    fn read_device_addresses_one_sensor_and_decodes() {
        let (pin, delay) = MockPin::pair();
        pin.script_presence_and_bytes(&scratchpad_for(401));
        let line = pin.0.clone();
        let mut bus = OneWireBus::new(pin, delay);

        let celsius = bus.read_device(&COIL).unwrap();

        assert_eq!(celsius, 25.0625);
        let mut expected = vec![CMD_MATCH_ROM];
        expected.extend_from_slice(&COIL.0);
        expected.push(CMD_READ_SCRATCHPAD);
        assert_eq!(line.borrow().written_transactions(), vec![expected]);
    }

    #[test]
    fn negative_fixed_point_is_sign_extended() {
        let (pin, delay) = MockPin::pair();
        pin.script_presence_and_bytes(&scratchpad_for(-162));
        let mut bus = OneWireBus::new(pin, delay);

        assert_eq!(bus.read_device(&COIL).unwrap(), -10.125);
    }

    #[test]
    fn corrupted_scratchpad_fails_checksum() {
        let mut scratchpad = scratchpad_for(401);
        scratchpad[0] ^= 0x04;
        let (pin, delay) = MockPin::pair();
        pin.script_presence_and_bytes(&scratchpad);
        let mut bus = OneWireBus::new(pin, delay);

        assert_eq!(bus.read_device(&COIL), Err(BusError::Checksum));
    }

    #[test]
    fn implausible_value_is_range_rejected() {
        assert_eq!(
            decode_scratchpad(&scratchpad_for(2048)),
            Err(BusError::OutOfRange(128.0))
        );
        assert_eq!(decode_scratchpad(&scratchpad_for(2000)), Ok(125.0));
        assert_eq!(decode_scratchpad(&scratchpad_for(-880)), Ok(-55.0));
    }

    #[test]
    fn slot_widths_follow_standard_timing() {
        let (pin, delay) = MockPin::pair();
        let line = pin.0.clone();
        let mut bus = OneWireBus::new(pin, delay);

        bus.write_byte(0b0000_0001).unwrap();

        let pulses = line.borrow().pulses.clone();
        assert_eq!(pulses.len(), 8);
        assert_eq!(pulses[0].width_us, 6);
        assert!(pulses[1..].iter().all(|pulse| pulse.width_us == 60));
    }

    #[test]
    fn reset_pulse_holds_line_low_long_enough() {
        let (pin, delay) = MockPin::pair();
        pin.script_presence_and_bytes(&[]);
        let line = pin.0.clone();
        let mut bus = OneWireBus::new(pin, delay);

        assert!(bus.reset().unwrap());
        assert!(line.borrow().pulses[0].width_us >= 480);
    }

    #[test]
    fn identity_displays_as_hex() {
        assert_eq!(COIL.to_string(), "28:BB:88:AF:00:00:00:27");
    }
}
