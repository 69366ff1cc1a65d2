use crate::problem::TestCase;
use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Verdict bitmask. Accepted is the empty set, not a bit of its own.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ResultFlags: u32 {
        const WA = 1 << 0;
        const RTE = 1 << 1;
        const TLE = 1 << 2;
        const MLE = 1 << 3;
        const IR = 1 << 4;
        const SC = 1 << 5;
        const OLE = 1 << 6;
        const IE = 1 << 30;
    }
}

impl ResultFlags {
    pub const AC: ResultFlags = ResultFlags::empty();

    /// Every verdict bit, highest priority first
    pub const PRIORITY: [(ResultFlags, &'static str); 8] = [
        (ResultFlags::IE, "IE"),
        (ResultFlags::TLE, "TLE"),
        (ResultFlags::MLE, "MLE"),
        (ResultFlags::OLE, "OLE"),
        (ResultFlags::IR, "IR"),
        (ResultFlags::RTE, "RTE"),
        (ResultFlags::WA, "WA"),
        (ResultFlags::SC, "SC"),
    ];

    /// Highest-priority set bit, or AC
    pub fn main_code(self) -> ResultFlags {
        Self::PRIORITY
            .iter()
            .find(|(flag, _)| self.contains(*flag))
            .map(|(flag, _)| *flag)
            .unwrap_or(ResultFlags::AC)
    }

    pub fn readable_codes(self) -> Vec<&'static str> {
        let codes: Vec<&'static str> = Self::PRIORITY
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if codes.is_empty() {
            vec!["AC"]
        } else {
            codes
        }
    }

    pub fn name(self) -> &'static str {
        Self::PRIORITY
            .iter()
            .find(|(flag, _)| *flag == self.main_code())
            .map(|(_, name)| *name)
            .unwrap_or("AC")
    }
}

impl Serialize for ResultFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for ResultFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u32::deserialize(deserializer).map(ResultFlags::from_bits_retain)
    }
}

/// Outcome of one test case as reported to the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub position: usize,
    pub result_flag: ResultFlags,
    /// CPU seconds
    pub execution_time: f64,
    pub wall_clock_time: f64,
    /// KB
    pub max_memory: u64,
    /// (voluntary, involuntary)
    pub context_switches: (u64, u64),
    pub runtime_version: String,
    pub proc_output: Vec<u8>,
    pub feedback: String,
    pub extended_feedback: String,
    pub points: f64,
    pub total_points: f64,
    pub output_prefix_length: usize,
}

impl TestResult {
    pub fn new(case: &TestCase) -> Self {
        Self {
            position: case.position,
            total_points: case.points as f64,
            output_prefix_length: case.output_prefix_length,
            ..Self::default()
        }
    }

    /// Result for a case skipped because an earlier one failed
    pub fn short_circuited(case: &TestCase) -> Self {
        Self {
            result_flag: ResultFlags::SC,
            ..Self::new(case)
        }
    }

    pub fn main_code(&self) -> ResultFlags {
        self.result_flag.main_code()
    }

    pub fn readable_codes(&self) -> Vec<&'static str> {
        self.result_flag.readable_codes()
    }

    pub fn is_accepted(&self) -> bool {
        self.result_flag.is_empty()
    }

    /// Output prefix shown to the user
    pub fn output(&self) -> String {
        let end = self.output_prefix_length.min(self.proc_output.len());
        String::from_utf8_lossy(&self.proc_output[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_flag_is_accepted() {
        assert_eq!(ResultFlags::empty().main_code(), ResultFlags::AC);
        assert_eq!(ResultFlags::empty().readable_codes(), vec!["AC"]);
        assert_eq!(ResultFlags::empty().name(), "AC");
    }

    #[test]
    fn test_tle_beats_wa() {
        let flags = ResultFlags::TLE | ResultFlags::WA;
        assert_eq!(flags.main_code(), ResultFlags::TLE);
        assert_eq!(flags.readable_codes(), vec!["TLE", "WA"]);
    }

    #[test]
    fn test_priority_holds_for_every_pair() {
        let order = ResultFlags::PRIORITY;
        for (i, (higher, _)) in order.iter().enumerate() {
            for (lower, _) in &order[i + 1..] {
                assert_eq!((*higher | *lower).main_code(), *higher, "{:?} vs {:?}", higher, lower);
            }
        }
    }

    #[test]
    fn test_bit_values_are_stable() {
        assert_eq!(ResultFlags::WA.bits(), 1);
        assert_eq!(ResultFlags::IR.bits(), 16);
        assert_eq!(ResultFlags::OLE.bits(), 64);
        assert_eq!(ResultFlags::IE.bits(), 1 << 30);
    }

    #[test]
    fn test_output_is_truncated_to_prefix() {
        let result = TestResult {
            proc_output: b"hello world".to_vec(),
            output_prefix_length: 5,
            ..TestResult::default()
        };
        assert_eq!(result.output(), "hello");

        let result = TestResult {
            proc_output: vec![0xff, b'a'],
            output_prefix_length: 10,
            ..TestResult::default()
        };
        assert_eq!(result.output(), "\u{fffd}a");
    }

    #[test]
    fn test_flags_serialize_as_integer() {
        let json = serde_json::to_string(&(ResultFlags::TLE | ResultFlags::WA)).unwrap();
        assert_eq!(json, "5");
    }
}
