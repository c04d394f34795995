/*!
Unit-carrying values for configuration files: times (`"250 ms"`, `"3 s"`) and link bandwidths
(`"100 Mbit"`, `"1 Gbit"`).

```
# use netsim::utility::units::*;
# use std::str::FromStr;
let hold = Time::from_str("10 s").unwrap();
assert_eq!(hold, Time::new(10, TimePrefix::Sec));
assert_eq!(hold.convert(TimePrefix::Milli).unwrap().value(), 10_000);

let speed = Bandwidth::from_str("100 Mbit").unwrap();
assert_eq!(speed.as_mbps(), 100);
```
*/

use std::fmt::{self, Debug, Display};
use std::marker::PhantomData;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::{Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

use crate::core::support::simulation_time::SimulationTime;

/// The magnitude part of a unit (`ms`, `M`, ...).
pub trait Prefix: Clone + Copy + Default + PartialEq + FromStr<Err = String> + Display + Debug {
    /// The magnitude of this prefix relative to other prefixes of this type.
    fn relative_magnitude(&self) -> u128;

    /// Fixed suffixes that may follow the prefix (for example "bit" in "Mbit"). The first is used
    /// when formatting.
    fn suffixes() -> &'static [&'static str];

    /// A short name for error messages and the configuration schema.
    fn unit_name() -> &'static str;

    fn conversion_factor(&self, to: Self) -> Result<u128, String> {
        let from_mag = self.relative_magnitude();
        let to_mag = to.relative_magnitude();
        if from_mag % to_mag != 0 {
            return Err(format!("Converting {self} to {to} would lose precision"));
        }
        Ok(from_mag / to_mag)
    }
}

/// Time units. These hold the whole unit ("ms", "min"), not only a magnitude prefix, so times have
/// no suffixes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TimePrefix {
    Nano,
    Micro,
    Milli,
    #[default]
    Sec,
    Min,
    Hour,
}

impl FromStr for TimePrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" | "nanosecond" | "nanoseconds" => Ok(Self::Nano),
            "us" | "μs" | "microsecond" | "microseconds" => Ok(Self::Micro),
            "ms" | "millisecond" | "milliseconds" => Ok(Self::Milli),
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(Self::Sec),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(Self::Min),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(Self::Hour),
            _ => Err(format!(
                "Time unit '{s}' was not one of (ns|us|μs|ms|s|sec|m|min|h|hr) \
                or their long forms"
            )),
        }
    }
}

impl Display for TimePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nano => "ns",
            Self::Micro => "μs",
            Self::Milli => "ms",
            Self::Sec => "s",
            Self::Min => "min",
            Self::Hour => "h",
        };
        f.write_str(s)
    }
}

impl Prefix for TimePrefix {
    fn relative_magnitude(&self) -> u128 {
        const NANOS_PER_SEC: u128 = 1_000_000_000;
        match self {
            Self::Nano => 1,
            Self::Micro => 1_000,
            Self::Milli => 1_000_000,
            Self::Sec => NANOS_PER_SEC,
            Self::Min => NANOS_PER_SEC * 60,
            Self::Hour => NANOS_PER_SEC * 60 * 60,
        }
    }

    fn suffixes() -> &'static [&'static str] {
        &[""]
    }

    fn unit_name() -> &'static str {
        "Time"
    }
}

/// Decimal magnitudes for bit rates. Interfaces only negotiate power-of-ten speeds, so there are
/// no binary prefixes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RatePrefix {
    #[default]
    Base,
    Kilo,
    Mega,
    Giga,
}

impl FromStr for RatePrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Base),
            "K" | "kilo" => Ok(Self::Kilo),
            "M" | "mega" => Ok(Self::Mega),
            "G" | "giga" => Ok(Self::Giga),
            _ => Err(format!("Rate prefix '{s}' was not one of (K|kilo|M|mega|G|giga)")),
        }
    }
}

impl Display for RatePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Base => "",
            Self::Kilo => "K",
            Self::Mega => "M",
            Self::Giga => "G",
        };
        f.write_str(s)
    }
}

impl Prefix for RatePrefix {
    fn relative_magnitude(&self) -> u128 {
        match self {
            Self::Base => 1,
            Self::Kilo => 1_000,
            Self::Mega => 1_000_000,
            Self::Giga => 1_000_000_000,
        }
    }

    fn suffixes() -> &'static [&'static str] {
        &["bit", "bits", "bps"]
    }

    fn unit_name() -> &'static str {
        "Bandwidth"
    }
}

/// An integer value with a unit prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity<P: Prefix> {
    value: u64,
    prefix: P,
}

/// An amount of time.
pub type Time = Quantity<TimePrefix>;

/// A throughput in bits per second.
pub type Bandwidth = Quantity<RatePrefix>;

impl<P: Prefix> Quantity<P> {
    pub const fn new(value: u64, prefix: P) -> Self {
        Self { value, prefix }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn prefix(&self) -> P {
        self.prefix
    }

    /// Convert to a different prefix. Fails if precision would be lost or the value overflows.
    pub fn convert(&self, prefix: P) -> Result<Self, String> {
        let factor = self.prefix.conversion_factor(prefix)?;
        let value = u128::from(self.value)
            .checked_mul(factor)
            .and_then(|x| u64::try_from(x).ok())
            .ok_or_else(|| format!("{self} is too large to express in {prefix}"))?;
        Ok(Self::new(value, prefix))
    }

    /// Convert to a different prefix, rounding to the nearest whole value.
    pub fn convert_lossy(&self, prefix: P) -> Self {
        let factor =
            self.prefix.relative_magnitude() as f64 / prefix.relative_magnitude() as f64;
        // float-to-int casts saturate
        Self::new((self.value as f64 * factor).round() as u64, prefix)
    }
}

impl<P: Prefix> Default for Quantity<P> {
    fn default() -> Self {
        Self::new(0, P::default())
    }
}

impl<P: Prefix> Display for Quantity<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{}", self.value, self.prefix, P::suffixes()[0])
    }
}

impl<P: Prefix> FromStr for Quantity<P> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([+-]?[0-9\.]*)\s*(.*)$").unwrap());

        let captures = RE
            .captures(s.trim())
            .ok_or_else(|| format!("Unable to identify a value and unit in '{s}'"))?;
        let value = captures.get(1).map_or("", |x| x.as_str());
        let unit = captures.get(2).map_or("", |x| x.as_str()).trim();

        let value: u64 = value
            .parse()
            .map_err(|e| format!("Invalid {} value '{value}': {e}", P::unit_name()))?;

        // the longest matching suffix wins, so that "bits" isn't read as prefix "s" + "bit"
        let prefix = P::suffixes()
            .iter()
            .filter(|suffix| !suffix.is_empty())
            .filter_map(|suffix| unit.strip_suffix(suffix).map(|p| (suffix.len(), p)))
            .max_by_key(|(len, _)| *len)
            .map_or(unit, |(_, p)| p);

        let prefix = match prefix {
            "" => P::default(),
            _ => P::from_str(prefix)?,
        };
        Ok(Self::new(value, prefix))
    }
}

impl<'de, P: Prefix> Deserialize<'de> for Quantity<P> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct QuantityVisitor<P>(PhantomData<P>);

        impl<'de, P: Prefix> Visitor<'de> for QuantityVisitor<P> {
            type Value = Quantity<P>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a {} such as \"10 {}{}\"", P::unit_name(), P::default(), P::suffixes()[0])
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Quantity::from_str(s).map_err(E::custom)
            }

            fn visit_u64<E>(self, x: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Quantity::new(x, P::default()))
            }

            fn visit_i64<E>(self, x: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let x = u64::try_from(x).map_err(E::custom)?;
                Ok(Quantity::new(x, P::default()))
            }
        }

        deserializer.deserialize_any(QuantityVisitor(PhantomData))
    }
}

impl<P: Prefix> Serialize for Quantity<P> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<P: Prefix> JsonSchema for Quantity<P> {
    fn is_referenceable() -> bool {
        false
    }

    fn schema_name() -> String {
        P::unit_name().to_owned()
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            format: Some(P::unit_name().to_owned()),
            ..Default::default()
        }
        .into()
    }
}

impl Time {
    pub fn from_secs(secs: u64) -> Self {
        Self::new(secs, TimePrefix::Sec)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(millis, TimePrefix::Milli)
    }
}

impl From<Time> for SimulationTime {
    fn from(time: Time) -> Self {
        // u64 nanoseconds covers ~584 years, so only absurd values saturate
        match time.convert(TimePrefix::Nano) {
            Ok(nanos) => SimulationTime::from_nanos(nanos.value()),
            Err(_) => SimulationTime::MAX,
        }
    }
}

impl From<Time> for std::time::Duration {
    fn from(time: Time) -> Self {
        SimulationTime::from(time).into()
    }
}

impl Bandwidth {
    pub fn from_mbps(mbps: u64) -> Self {
        Self::new(mbps, RatePrefix::Mega)
    }

    /// The rate in whole megabits per second, rounded down.
    pub fn as_mbps(&self) -> u64 {
        let bits = u128::from(self.value) * self.prefix.relative_magnitude();
        u64::try_from(bits / RatePrefix::Mega.relative_magnitude()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(Time::from_str("10").unwrap(), Time::new(10, TimePrefix::Sec));
        assert_eq!(Time::from_str("10 s").unwrap(), Time::new(10, TimePrefix::Sec));
        assert_eq!(Time::from_str("10s").unwrap(), Time::new(10, TimePrefix::Sec));
        assert_eq!(Time::from_str("10   sec").unwrap(), Time::new(10, TimePrefix::Sec));
        assert_eq!(Time::from_str("3 min").unwrap(), Time::new(3, TimePrefix::Min));
        assert_eq!(Time::from_str("250 ms").unwrap(), Time::new(250, TimePrefix::Milli));
        assert_eq!(Time::from_str("10 μs").unwrap(), Time::new(10, TimePrefix::Micro));
        assert_eq!(
            Time::from_str("10 milliseconds").unwrap(),
            Time::new(10, TimePrefix::Milli)
        );

        assert!(Time::from_str("-10 ms").is_err());
        assert!(Time::from_str("abc 10 ms").is_err());
        assert!(Time::from_str("10.5 ms").is_err());
        assert!(Time::from_str("10 abc").is_err());
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(Bandwidth::from_str("10").unwrap(), Bandwidth::new(10, RatePrefix::Base));
        assert_eq!(
            Bandwidth::from_str("100 Mbit").unwrap(),
            Bandwidth::new(100, RatePrefix::Mega)
        );
        assert_eq!(
            Bandwidth::from_str("1Gbit").unwrap(),
            Bandwidth::new(1, RatePrefix::Giga)
        );
        assert_eq!(
            Bandwidth::from_str("10 megabits").unwrap(),
            Bandwidth::new(10, RatePrefix::Mega)
        );
        assert_eq!(
            Bandwidth::from_str("10 Kbps").unwrap(),
            Bandwidth::new(10, RatePrefix::Kilo)
        );

        assert!(Bandwidth::from_str("10 mbit").is_err());
        assert!(Bandwidth::from_str("10 Mibit").is_err());
        assert!(Bandwidth::from_str("-1 Mbit").is_err());
    }

    #[test]
    fn test_conversion() {
        let time = Time::from_str("70 min").unwrap();
        assert_eq!(time.convert(TimePrefix::Sec).unwrap(), Time::from_secs(4200));
        assert!(time.convert(TimePrefix::Hour).is_err());
        assert_eq!(time.convert_lossy(TimePrefix::Hour), Time::new(1, TimePrefix::Hour));

        assert_eq!(Bandwidth::from_str("1 Gbit").unwrap().as_mbps(), 1000);
        assert_eq!(Bandwidth::from_str("1500 Kbit").unwrap().as_mbps(), 1);
        assert_eq!(Bandwidth::from_mbps(100).to_string(), "100 Mbit");
    }

    #[test]
    fn test_to_simulation_time() {
        assert_eq!(
            SimulationTime::from(Time::from_millis(1500)),
            SimulationTime::from_millis(1500)
        );
        assert_eq!(
            SimulationTime::from(Time::new(u64::MAX, TimePrefix::Hour)),
            SimulationTime::MAX
        );
        assert_eq!(Time::from_secs(3).to_string(), "3 s");
    }

    #[test]
    fn test_deserialize() {
        let t: Time = serde_yaml::from_str("\"250 ms\"").unwrap();
        assert_eq!(t, Time::from_millis(250));
        let t: Time = serde_yaml::from_str("5").unwrap();
        assert_eq!(t, Time::from_secs(5));
        assert!(serde_yaml::from_str::<Time>("\"5 parsecs\"").is_err());
    }
}
