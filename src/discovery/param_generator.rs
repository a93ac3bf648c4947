//! Parameter Generator: a lazy, pull-based enumerator of the Cartesian
//! product of serial parameters and slave addresses.
//!
//! Grounded in the standard serial-parameter tables already defined for
//! `transport::bus_key`, composed with `Iterator::flat_map`/`.map()`
//! adapters rather than an eagerly materialized `Vec`, so a `thorough`
//! sweep (~24k combinations) never exists as one collection in memory
//! — only the current group's address list (≤247 entries) is ever
//! materialized at a time.

use crate::transport::bus_key::{
    Parity, SerialParams, SlaveAddress, MAX_UNICAST_ADDRESS, MIN_UNICAST_ADDRESS, STANDARD_BAUD_RATES,
    STANDARD_DATA_BITS, STANDARD_PARITIES, STANDARD_STOP_BITS,
};

const QUICK_BAUD_RATES: &[u32] = &[9600, 19200];
const QUICK_DATA_BITS: &[u8] = &[8];
const QUICK_STOP_BITS: &[u8] = &[1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Quick,
    Thorough,
}

/// Driver-declared restrictions on the swept parameter space. Any field
/// left `None` falls back to the strategy's own list; `address_range`
/// replaces the generator's default `[1, 247]` when present.
#[derive(Debug, Clone, Default)]
pub struct SupportedConfig {
    pub baud_rates: Option<Vec<u32>>,
    pub parities: Option<Vec<Parity>>,
    pub data_bits: Option<Vec<u8>>,
    pub stop_bits: Option<Vec<u8>>,
    pub address_range: Option<(SlaveAddress, SlaveAddress)>,
}

#[derive(Debug, Clone)]
pub struct ParameterGeneratorConfig {
    pub strategy: Strategy,
    /// A driver's preferred parameters, tested first when present.
    pub default_config: Option<SerialParams>,
    pub supported_config: Option<SupportedConfig>,
    pub address_range: (SlaveAddress, SlaveAddress),
}

impl Default for ParameterGeneratorConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Quick,
            default_config: None,
            supported_config: None,
            address_range: (MIN_UNICAST_ADDRESS, MAX_UNICAST_ADDRESS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterCombination {
    pub serial_params: SerialParams,
    pub address: SlaveAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroup {
    pub serial_params: SerialParams,
    /// Priority-ordered: ascending from the low end of the address
    /// range, so 1 and 2 lead whenever they fall inside it.
    pub addresses: Vec<SlaveAddress>,
}

fn effective_list<'a, T: Copy>(restricted: &'a Option<Vec<T>>, strategy_default: &'a [T]) -> Vec<T> {
    restricted.clone().unwrap_or_else(|| strategy_default.to_vec())
}

fn effective_address_range(cfg: &ParameterGeneratorConfig) -> (SlaveAddress, SlaveAddress) {
    cfg.supported_config.as_ref().and_then(|s| s.address_range).unwrap_or(cfg.address_range)
}

/// The full ordered serial-parameter tuple list, with `default_config`
/// (if present and in range) moved to the front.
fn effective_serial_params(cfg: &ParameterGeneratorConfig) -> Vec<SerialParams> {
    let (baud_rates, parities, data_bits, stop_bits) = match &cfg.supported_config {
        Some(supported) => (
            effective_list(&supported.baud_rates, strategy_baud_rates(cfg.strategy)),
            effective_list(&supported.parities, STANDARD_PARITIES),
            effective_list(&supported.data_bits, strategy_data_bits(cfg.strategy)),
            effective_list(&supported.stop_bits, strategy_stop_bits(cfg.strategy)),
        ),
        None => (
            strategy_baud_rates(cfg.strategy).to_vec(),
            STANDARD_PARITIES.to_vec(),
            strategy_data_bits(cfg.strategy).to_vec(),
            strategy_stop_bits(cfg.strategy).to_vec(),
        ),
    };

    let mut combos = Vec::with_capacity(baud_rates.len() * parities.len() * data_bits.len() * stop_bits.len());
    for &baud_rate in &baud_rates {
        for &parity in &parities {
            for &db in &data_bits {
                for &sb in &stop_bits {
                    combos.push(SerialParams { baud_rate, parity, data_bits: db, stop_bits: sb });
                }
            }
        }
    }

    if let Some(default) = cfg.default_config {
        if let Some(pos) = combos.iter().position(|c| *c == default) {
            let promoted = combos.remove(pos);
            combos.insert(0, promoted);
        }
    }

    combos
}

fn strategy_baud_rates(strategy: Strategy) -> &'static [u32] {
    match strategy {
        Strategy::Quick => QUICK_BAUD_RATES,
        Strategy::Thorough => STANDARD_BAUD_RATES,
    }
}

fn strategy_data_bits(strategy: Strategy) -> &'static [u8] {
    match strategy {
        Strategy::Quick => QUICK_DATA_BITS,
        Strategy::Thorough => STANDARD_DATA_BITS,
    }
}

fn strategy_stop_bits(strategy: Strategy) -> &'static [u8] {
    match strategy {
        Strategy::Quick => QUICK_STOP_BITS,
        Strategy::Thorough => STANDARD_STOP_BITS,
    }
}

pub struct ParameterGenerator;

impl ParameterGenerator {
    /// Product of the four serial-parameter cardinalities times the
    /// address-range cardinality. No allocation beyond the (tiny)
    /// serial-tuple list.
    pub fn count_combinations(cfg: &ParameterGeneratorConfig) -> usize {
        let serial_count = effective_serial_params(cfg).len();
        let (lo, hi) = effective_address_range(cfg);
        let addr_count = (hi as usize).saturating_sub(lo as usize) + 1;
        serial_count * addr_count
    }

    /// Flat, lazy sequence of every combination. Never materializes the
    /// whole product: only the serial-tuple list (≤96 entries) is built
    /// up front, and the address range is walked with a plain integer
    /// range.
    pub fn enumerate(cfg: &ParameterGeneratorConfig) -> impl Iterator<Item = ParameterCombination> + '_ {
        let (lo, hi) = effective_address_range(cfg);
        effective_serial_params(cfg)
            .into_iter()
            .flat_map(move |serial_params| (lo..=hi).map(move |address| ParameterCombination { serial_params, address }))
    }

    /// One group per serial-parameter tuple, each carrying its full
    /// priority-ordered address list. Consumers pace connection opens
    /// one group at a time.
    pub fn enumerate_groups(cfg: &ParameterGeneratorConfig) -> impl Iterator<Item = ParameterGroup> + '_ {
        let (lo, hi) = effective_address_range(cfg);
        effective_serial_params(cfg)
            .into_iter()
            .map(move |serial_params| ParameterGroup { serial_params, addresses: (lo..=hi).collect() })
    }
}
