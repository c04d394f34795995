use std::fmt;

/// A duration split into hours, minutes, seconds and nanoseconds, for log timestamps.
#[derive(Debug, Eq, PartialEq)]
pub struct TimeParts {
    pub hours: u64,
    pub mins: u32,
    pub secs: u32,
    pub nanos: u32,
}

impl TimeParts {
    pub fn from_nanos(total_nanos: u128) -> Self {
        const NANOS_PER_SEC: u128 = 1_000_000_000;
        let whole_secs = total_nanos / NANOS_PER_SEC;
        let whole_mins = whole_secs / 60;

        // the casts below are all of values already reduced below their type's range
        Self {
            hours: u64::try_from(whole_mins / 60).unwrap_or(u64::MAX),
            mins: (whole_mins % 60) as u32,
            secs: (whole_secs % 60) as u32,
            nanos: (total_nanos % NANOS_PER_SEC) as u32,
        }
    }
}

impl fmt::Display for TimeParts {
    /// `HH:MM:SS.nnnnnnnnn`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}.{:09}",
            self.hours, self.mins, self.secs, self.nanos
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_time_parts() {
        let parts = TimeParts::from_nanos(
            (Duration::from_nanos(1) + Duration::from_secs(3600 + 60 + 1)).as_nanos(),
        );
        assert_eq!(
            parts,
            TimeParts {
                hours: 1,
                mins: 1,
                secs: 1,
                nanos: 1
            }
        );
        assert_eq!(parts.to_string(), "01:01:01.000000001");
    }
}
