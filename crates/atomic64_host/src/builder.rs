//! Generation of an atomics library together with its lock buffer.

use std::env;

use atomic64::SlotHasher;
use atomic64::hash::{DEFAULT_HASH_XOR, DEFAULT_SLOT_BITS, MAX_SLOT_BITS};
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::library::{
    Atomic64Library, CompileOptions, DEFAULT_INSTALL_NAME, Float64Library, HASH_XOR,
    LOCK_BUFFER_ADDRESS, OptLevel, SLOT_MASK,
};
use crate::lock_buffer::LockBuffer;

/// Environment variable overriding the number of slots, as a power of two exponent.
pub const SLOT_BITS_ENV: &str = "ATOMIC64_SLOT_BITS";
/// Environment variable overriding the hash xor constant. Accepts decimal or `0x` hex.
pub const HASH_XOR_ENV: &str = "ATOMIC64_HASH_XOR";

/// Configures and generates atomics libraries.
///
/// ```no_run
/// # use atomic64_host::prelude::*;
/// let device = Device::system_default();
/// let float64 = Float64Library::new(&device);
/// let (library, lock_buffer) = Atomic64Builder::new()
///     .slot_count(1 << 12)
///     .generate(&float64)?;
/// # Ok::<(), HostError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atomic64Builder {
    /// Number of lock slots. Must be a power of two.
    /// `65536` by default.
    pub slot_count: usize,
    /// Constant mixed into every slot index. Must be odd.
    /// `0x5A39` by default.
    pub hash_xor: u32,
    /// Optimization level the module is compiled with.
    /// [`OptLevel::Size`] by default.
    pub opt_level: OptLevel,
    /// Name other modules use to locate the generated library.
    pub install_name: String,
}

impl Default for Atomic64Builder {
    fn default() -> Self {
        Self {
            slot_count: 1 << DEFAULT_SLOT_BITS,
            hash_xor: DEFAULT_HASH_XOR,
            opt_level: OptLevel::default(),
            install_name: String::from(DEFAULT_INSTALL_NAME),
        }
    }
}

impl Atomic64Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by [`SLOT_BITS_ENV`] and [`HASH_XOR_ENV`] when set.
    pub fn from_env() -> HostResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`Atomic64Builder::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HostResult<Self> {
        let mut builder = Self::default();
        if let Some(bits) = read_env(&lookup, SLOT_BITS_ENV)? {
            let bits = u32::try_from(bits)
                .ok()
                .filter(|bits| *bits < usize::BITS)
                .ok_or(HostError::InvalidSlotCount(usize::MAX))?;
            builder.slot_count = 1 << bits;
        }
        if let Some(xor) = read_env(&lookup, HASH_XOR_ENV)? {
            builder.hash_xor =
                u32::try_from(xor).map_err(|_| HostError::InvalidHashXor(u32::MAX))?;
        }
        Ok(builder)
    }

    pub fn slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn hash_xor(mut self, hash_xor: u32) -> Self {
        self.hash_xor = hash_xor;
        self
    }

    pub fn opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn install_name(mut self, install_name: impl Into<String>) -> Self {
        self.install_name = install_name.into();
        self
    }

    /// Validates the configuration and returns the slot hash it describes.
    pub fn hasher(&self) -> HostResult<SlotHasher> {
        let bits = self.slot_count.trailing_zeros();
        if !self.slot_count.is_power_of_two() || bits == 0 || bits > MAX_SLOT_BITS {
            return Err(HostError::InvalidSlotCount(self.slot_count));
        }
        if self.hash_xor & 1 == 0 {
            return Err(HostError::InvalidHashXor(self.hash_xor));
        }
        Ok(SlotHasher::new(bits, self.hash_xor))
    }

    /// Allocates a fresh lock buffer on `float64`'s device and compiles a library
    /// addressing it. Every call produces an independent pair.
    pub fn generate(&self, float64: &Float64Library) -> HostResult<(Atomic64Library, LockBuffer)> {
        let hasher = self.hasher()?;
        let device = float64.device();
        let lock_buffer = LockBuffer::new(device, hasher)?;
        let address = lock_buffer.gpu_address();
        debug!(
            device = device.id(),
            address = format_args!("{address:#x}"),
            slots = hasher.slot_count(),
            "generating atomics library"
        );

        let options = CompileOptions {
            opt_level: self.opt_level,
            install_name: self.install_name.clone(),
            ..Default::default()
        }
        .constant(LOCK_BUFFER_ADDRESS, address as u64)
        .constant(SLOT_MASK, u64::from(hasher.mask()))
        .constant(HASH_XOR, u64::from(hasher.xor()));
        let library = Atomic64Library::compile(device, float64, &options)?;
        Ok((library, lock_buffer))
    }
}

/// Generates a library and lock buffer with the default configuration.
pub fn generate_library(float64: &Float64Library) -> HostResult<(Atomic64Library, LockBuffer)> {
    Atomic64Builder::default().generate(float64)
}

fn read_env(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> HostResult<Option<u64>> {
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    parse_int(&value)
        .map(Some)
        .ok_or(HostError::InvalidEnv { name, value })
}

fn parse_int(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use proptest::prelude::*;

    fn vars<'a>(pairs: &'a [(&str, &str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn defaults() {
        let builder = Atomic64Builder::new();
        assert_eq!(builder.slot_count, 65536);
        assert_eq!(builder.hash_xor, 0x5A39);
        assert_eq!(builder.hasher(), Ok(SlotHasher::default()));
    }

    #[test]
    fn rejects_bad_configuration() {
        assert_eq!(
            Atomic64Builder::new().slot_count(1000).hasher(),
            Err(HostError::InvalidSlotCount(1000))
        );
        assert_eq!(
            Atomic64Builder::new().slot_count(1).hasher(),
            Err(HostError::InvalidSlotCount(1))
        );
        assert_eq!(
            Atomic64Builder::new().hash_xor(0x5A38).hasher(),
            Err(HostError::InvalidHashXor(0x5A38))
        );
    }

    #[test]
    fn generated_library_addresses_its_buffer() {
        let device = Device::system_default();
        let float64 = Float64Library::new(&device);
        let (library, buffer) = Atomic64Builder::new()
            .slot_count(1 << 10)
            .opt_level(OptLevel::Speed)
            .install_name("libtest")
            .generate(&float64)
            .unwrap();
        assert_eq!(library.lock_buffer_address(), buffer.gpu_address());
        assert_eq!(library.hasher(), buffer.hasher());
        assert_eq!(library.opt_level(), OptLevel::Speed);
        assert_eq!(library.install_name(), "libtest");
    }

    #[test]
    fn each_call_is_independent() {
        let device = Device::system_default();
        let float64 = Float64Library::new(&device);
        let (a, buffer_a) = generate_library(&float64).unwrap();
        let (b, buffer_b) = generate_library(&float64).unwrap();
        assert_ne!(a.lock_buffer_address(), b.lock_buffer_address());
        assert_ne!(buffer_a.gpu_address(), buffer_b.gpu_address());
    }

    #[test]
    fn environment_overrides_defaults() {
        assert_eq!(Atomic64Builder::from_lookup(vars(&[])), Ok(Atomic64Builder::new()));

        let builder =
            Atomic64Builder::from_lookup(vars(&[(SLOT_BITS_ENV, "12"), (HASH_XOR_ENV, "0x1F")]))
                .unwrap();
        assert_eq!(builder.slot_count, 4096);
        assert_eq!(builder.hash_xor, 0x1F);
        assert_eq!(builder.hasher(), Ok(SlotHasher::new(12, 0x1F)));
    }

    #[test]
    fn environment_values_validated() {
        assert_eq!(
            Atomic64Builder::from_lookup(vars(&[(SLOT_BITS_ENV, "abc")])),
            Err(HostError::InvalidEnv {
                name: SLOT_BITS_ENV,
                value: String::from("abc")
            })
        );
        assert_eq!(
            Atomic64Builder::from_lookup(vars(&[(SLOT_BITS_ENV, "64")])),
            Err(HostError::InvalidSlotCount(usize::MAX))
        );
        assert_eq!(
            Atomic64Builder::from_lookup(vars(&[(HASH_XOR_ENV, "0x100000000")])),
            Err(HostError::InvalidHashXor(u32::MAX))
        );
        // parsed, then rejected when the hash is built
        let builder = Atomic64Builder::from_lookup(vars(&[(HASH_XOR_ENV, "2")])).unwrap();
        assert_eq!(builder.hasher(), Err(HostError::InvalidHashXor(2)));
    }

    #[test]
    fn from_env_reads_process_environment() {
        // SAFETY: no other test in this crate touches these variables.
        unsafe { env::set_var(SLOT_BITS_ENV, "9") };
        let builder = Atomic64Builder::from_env();
        unsafe { env::remove_var(SLOT_BITS_ENV) };
        assert_eq!(builder.map(|b| b.slot_count), Ok(512));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn valid_configurations_generate_aligned_pairs(bits in 1u32..=12, xor in any::<u32>()) {
            let xor = xor | 1;
            let device = Device::system_default();
            let float64 = Float64Library::new(&device);
            let builder = Atomic64Builder::new().slot_count(1 << bits).hash_xor(xor);
            let (library, buffer) = builder.generate(&float64).unwrap();
            prop_assert_eq!(library.lock_buffer_address(), buffer.gpu_address());
            prop_assert_eq!(buffer.gpu_address() % library.hasher().table_bytes(), 0);
            prop_assert_eq!(buffer.slot_count(), 1 << bits);
            prop_assert_eq!(library.hasher(), SlotHasher::new(bits, xor));
        }
    }

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_int("16"), Some(16));
        assert_eq!(parse_int(" 0x5A39 "), Some(0x5A39));
        assert_eq!(parse_int("0xZZ"), None);
        assert_eq!(parse_int("slots"), None);
    }
}
