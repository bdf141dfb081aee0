use crate::auxiliary_reader::AuxiliaryPower;

/// Aggregate power of the virtual meter in W. Positive is import, negative
/// is export; the sign is left for consumers to interpret.
pub fn combine(primary_power: f64, auxiliary: &AuxiliaryPower) -> f64 {
    primary_power + auxiliary.total()
}
