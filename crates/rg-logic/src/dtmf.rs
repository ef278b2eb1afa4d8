//! DTMF digit aggregation
//!
//! Turns a stream of detected digits into complete commands. `#`
//! terminates a command. `A` arms anti-flutter mode where consecutive
//! duplicate digits are suppressed and `B` commits the previous digit;
//! `C` terminates while anti-flutter is armed. `D` restarts the buffer
//! with a literal `D` and `H` appends a literal `#` so macros can carry
//! hash marks. The buffer is capped at 20 digits and an inter-digit
//! timeout silently discards a half-entered command.

use rg_core::Timer;

const MAX_DIGITS: usize = 20;
const CMD_TIMEOUT_MS: u64 = 10_000;

pub struct DtmfAggregator {
    buffer: String,
    anti_flutter: bool,
    prev_digit: char,
    cmd_timeout: Timer,
}

impl DtmfAggregator {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            anti_flutter: false,
            prev_digit: '?',
            cmd_timeout: Timer::one_shot(CMD_TIMEOUT_MS),
        }
    }

    pub fn set_cmd_timeout(&mut self, timeout_ms: u64) {
        self.cmd_timeout.set_timeout(timeout_ms);
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn anti_flutter(&self) -> bool {
        self.anti_flutter
    }

    /// Feed one digit. Returns the completed command when the digit
    /// terminates one.
    pub fn digit_received(&mut self, digit: char, now_ms: u64) -> Option<String> {
        self.cmd_timeout.reset(now_ms);

        if digit == '#' || (self.anti_flutter && digit == 'C') {
            let cmd = std::mem::take(&mut self.buffer);
            self.reset();
            if cmd.is_empty() {
                return None;
            }
            return Some(cmd);
        } else if digit == 'A' {
            self.anti_flutter = true;
            self.prev_digit = '?';
        } else if digit == 'D' {
            self.buffer = "D".to_string();
            self.prev_digit = '?';
        } else if self.buffer.len() < MAX_DIGITS {
            if digit == 'H' {
                // Literal hash mark, used inside macros
                self.buffer.push('#');
            } else if digit == 'B' {
                if self.anti_flutter && self.prev_digit != '?' {
                    self.buffer.push(self.prev_digit);
                    self.prev_digit = '?';
                }
            } else if digit.is_ascii_digit() || (digit == '*' && self.buffer != "*") {
                if self.anti_flutter {
                    if digit != self.prev_digit {
                        self.buffer.push(digit);
                        self.prev_digit = digit;
                    }
                } else {
                    self.buffer.push(digit);
                }
            }
        }
        None
    }

    /// Complete whatever is buffered, as if a terminator had arrived
    pub fn force_command_complete(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let cmd = std::mem::take(&mut self.buffer);
        self.reset();
        Some(cmd)
    }

    /// Discard state; safe to call at any time
    pub fn reset(&mut self) {
        self.cmd_timeout.stop();
        self.buffer.clear();
        self.anti_flutter = false;
        self.prev_digit = '?';
    }

    /// Drive the inter-digit timeout; expiry clears without completing
    pub fn tick(&mut self, now_ms: u64) {
        if self.cmd_timeout.poll(now_ms) {
            self.buffer.clear();
            self.anti_flutter = false;
            self.prev_digit = '?';
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.cmd_timeout.deadline()
    }
}

impl Default for DtmfAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(agg: &mut DtmfAggregator, digits: &str) -> Option<String> {
        let mut result = None;
        for d in digits.chars() {
            result = agg.digit_received(d, 0);
        }
        result
    }

    #[test]
    fn test_simple_command() {
        let mut agg = DtmfAggregator::new();
        assert_eq!(feed(&mut agg, "123#"), Some("123".to_string()));
        assert_eq!(agg.buffer(), "");
    }

    #[test]
    fn test_empty_terminator_no_command() {
        let mut agg = DtmfAggregator::new();
        assert_eq!(feed(&mut agg, "#"), None);
    }

    #[test]
    fn test_buffer_cap_at_20() {
        let mut agg = DtmfAggregator::new();
        for _ in 0..30 {
            agg.digit_received('5', 0);
        }
        assert_eq!(agg.buffer().len(), 20);
        let cmd = agg.digit_received('#', 0).unwrap();
        assert_eq!(cmd.len(), 20);
    }

    #[test]
    fn test_anti_flutter_dedup_and_commit() {
        let mut agg = DtmfAggregator::new();
        // A arms anti-flutter; duplicates of 5 suppressed; B commits the 5
        assert_eq!(feed(&mut agg, "A55535B"), None);
        assert_eq!(agg.buffer(), "5355");
        // C completes while armed
        assert_eq!(agg.digit_received('C', 0), Some("5355".to_string()));
    }

    #[test]
    fn test_c_without_anti_flutter_is_ignored() {
        let mut agg = DtmfAggregator::new();
        assert_eq!(feed(&mut agg, "12C"), None);
        assert_eq!(agg.buffer(), "12");
    }

    #[test]
    fn test_b_outside_anti_flutter_does_nothing() {
        let mut agg = DtmfAggregator::new();
        feed(&mut agg, "1B2");
        assert_eq!(agg.buffer(), "12");
    }

    #[test]
    fn test_d_restarts_buffer() {
        let mut agg = DtmfAggregator::new();
        feed(&mut agg, "123D7");
        assert_eq!(agg.buffer(), "D7");
    }

    #[test]
    fn test_h_appends_literal_hash() {
        let mut agg = DtmfAggregator::new();
        feed(&mut agg, "1H2");
        assert_eq!(agg.buffer(), "1#2");
    }

    #[test]
    fn test_star_deduped_at_buffer_start() {
        let mut agg = DtmfAggregator::new();
        feed(&mut agg, "**1*");
        assert_eq!(agg.buffer(), "*1*");
    }

    #[test]
    fn test_timeout_clears_buffer_and_anti_flutter() {
        let mut agg = DtmfAggregator::new();
        agg.digit_received('A', 0);
        agg.digit_received('1', 0);
        agg.tick(9_999);
        assert_eq!(agg.buffer(), "1");
        agg.tick(10_000);
        assert_eq!(agg.buffer(), "");
        assert!(!agg.anti_flutter());
    }

    #[test]
    fn test_digit_resets_timeout() {
        let mut agg = DtmfAggregator::new();
        agg.digit_received('1', 0);
        agg.digit_received('2', 8_000);
        agg.tick(10_000);
        assert_eq!(agg.buffer(), "12");
        agg.tick(18_000);
        assert_eq!(agg.buffer(), "");
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut agg = DtmfAggregator::new();
        feed(&mut agg, "A12");
        agg.reset();
        agg.reset();
        assert_eq!(agg.buffer(), "");
        assert!(!agg.anti_flutter());
        assert!(agg.next_deadline().is_none());
    }

    #[test]
    fn test_force_command_complete() {
        let mut agg = DtmfAggregator::new();
        feed(&mut agg, "42");
        assert_eq!(agg.force_command_complete(), Some("42".to_string()));
        assert_eq!(agg.force_command_complete(), None);
    }
}
