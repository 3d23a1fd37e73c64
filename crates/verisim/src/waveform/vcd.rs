//! Value change dump decoding.
//!
//! Only the subset Icarus Verilog emits for two-state testbenches is
//! interpreted: `$timescale`, `$var` declarations, `#<time>` markers and
//! binary value changes. Scopes are flattened; signals are keyed by their
//! dump alias. Records that cannot be represented (unknown aliases, `x`/`z`
//! values, real changes, repeated declarations) are skipped and listed in
//! [`ParseReport::ignored`].

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use super::{Signal, TimeUnit, VerilogDataType, WaveformBuilder, WaveformData};
use crate::error::Error;

#[allow(clippy::expect_used)]
static TIMESCALE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$timescale\s+(\d*)\s*([a-zA-Z]*)\s*\$end").expect("timescale pattern is valid")
});

#[allow(clippy::expect_used)]
static VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\$var\s(.*?)\$end").expect("var pattern is valid")
});

#[allow(clippy::expect_used)]
static COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\$comment\b.*?\$end").expect("comment pattern is valid")
});

#[allow(clippy::expect_used)]
static HEADER_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\$(?:date|version|timescale|scope|upscope|var)\b.*?\$end")
        .expect("header section pattern is valid")
});

const END_DEFINITIONS: &str = "$enddefinitions";

/// How declared widths constrain recorded values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WidthPolicy {
    /// Width is informational; values are stored as dumped.
    #[default]
    Ignore,
    /// Bits above the declared width are dropped.
    Truncate,
    /// A value wider than its signal is a malformed dump.
    Reject,
}

/// Parser settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// How declared widths constrain recorded values.
    pub width_policy: WidthPolicy,
}

impl ParseOptions {
    /// Use `policy` for declared widths.
    #[must_use]
    pub const fn with_width_policy(mut self, policy: WidthPolicy) -> Self {
        self.width_policy = policy;
        self
    }
}

/// A dump record that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    /// A second declaration reused an alias; the first one was kept.
    DuplicateAlias {
        /// Reused alias.
        alias: String,
        /// Name given by the skipped declaration.
        name: String,
    },
    /// A value change named an alias that was never declared.
    UnregisteredAlias {
        /// Unknown alias.
        alias: String,
        /// Time of the change.
        time: i64,
    },
    /// A value change was not a plain binary number.
    NonBinaryValue {
        /// Alias of the changed signal.
        alias: String,
        /// Time of the change.
        time: i64,
        /// Value as dumped.
        value: String,
    },
}

/// Decoded waveform plus the records that were skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseReport {
    /// The decoded waveform.
    pub waveform: WaveformData,
    /// Skipped records, in dump order.
    pub ignored: Vec<Ignored>,
}

/// Decode `text` with default options.
///
/// # Errors
///
/// Returns [`Error::MalformedDump`] if a declaration or value change cannot be
/// decoded, or if a signal receives two values at the same time or a value
/// before its last one.
pub fn parse(text: &str) -> Result<WaveformData, Error> {
    parse_with_report(text, ParseOptions::default()).map(|report| report.waveform)
}

/// Decode `text`, reporting skipped records.
///
/// # Errors
///
/// See [`parse`]. With [`WidthPolicy::Reject`], values wider than their
/// signal are also errors.
pub fn parse_with_report(text: &str, options: ParseOptions) -> Result<ParseReport, Error> {
    let stripped = COMMENT.replace_all(text, " ");
    let text: &str = &stripped;
    let (header, body) = match text.find(END_DEFINITIONS) {
        Some(at) => (&text[..at], Cow::Borrowed(&text[at + END_DEFINITIONS.len()..])),
        None => (text, HEADER_SECTION.replace_all(text, " ")),
    };

    let (time_unit, time_scale) = timescale(header);
    let mut parser = Parser {
        builder: WaveformData::builder(time_unit, time_scale),
        ignored: Vec::new(),
        options,
        time: 0,
    };

    for caps in VAR.captures_iter(header) {
        if let Some(record) = caps.get(1) {
            parser.declare(record.as_str())?;
        }
    }

    let mut tokens = body.split_whitespace();
    while let Some(token) = tokens.next() {
        parser.token(token, &mut tokens)?;
    }

    let waveform = parser.builder.build();
    tracing::debug!(
        signals = waveform.len(),
        ignored = parser.ignored.len(),
        unit = %waveform.time_unit(),
        scale = waveform.time_scale(),
        "Parsed waveform dump"
    );
    Ok(ParseReport {
        waveform,
        ignored: parser.ignored,
    })
}

fn timescale(header: &str) -> (TimeUnit, u64) {
    match TIMESCALE.captures(header) {
        Some(caps) => {
            let scale = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0);
            let unit = caps.get(2).map_or(TimeUnit::Ns, |m| TimeUnit::from_token(m.as_str()));
            (unit, scale)
        }
        None => (TimeUnit::Ns, 0),
    }
}

struct Parser {
    builder: WaveformBuilder,
    ignored: Vec<Ignored>,
    options: ParseOptions,
    time: i64,
}

impl Parser {
    /// Handle the body of one `$var ... $end` record.
    fn declare(&mut self, record: &str) -> Result<(), Error> {
        let mut fields = record.split_whitespace();
        let (Some(kind), Some(width), Some(alias)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed(format!("incomplete $var record '{}'", record.trim())));
        };
        let name = fields.next().unwrap_or_default();
        let width = width
            .parse::<u32>()
            .map_err(|_| malformed(format!("invalid width '{width}' for '{alias}'")))?;
        let signal = Signal::new(VerilogDataType::from_keyword(kind), name, width)
            .map_err(|e| malformed(format!("$var '{alias}': {e}")))?;

        if self.builder.contains(alias) {
            self.skip(Ignored::DuplicateAlias {
                alias: alias.to_string(),
                name: signal.name().to_string(),
            });
            return Ok(());
        }
        self.builder
            .add_signal(alias, signal)
            .map_err(|e| malformed(e.to_string()))
    }

    fn token<'a>(
        &mut self,
        token: &'a str,
        rest: &mut impl Iterator<Item = &'a str>,
    ) -> Result<(), Error> {
        if token.starts_with('$') {
            return Ok(());
        }
        if let Some(time) = token.strip_prefix('#') {
            self.time = time
                .parse::<i64>()
                .map_err(|_| malformed(format!("invalid time marker '{token}'")))?;
            return Ok(());
        }
        if let Some(bits) = token.strip_prefix(['b', 'B']) {
            let alias = rest
                .next()
                .ok_or_else(|| malformed(format!("value '{token}' has no alias")))?;
            return self.change(bits, alias);
        }
        if token.starts_with(['r', 'R']) {
            let alias = rest
                .next()
                .ok_or_else(|| malformed(format!("value '{token}' has no alias")))?;
            self.skip(Ignored::NonBinaryValue {
                alias: alias.to_string(),
                time: self.time,
                value: token.to_string(),
            });
            return Ok(());
        }

        let (bits, alias) = self.split_scalar(token);
        if bits.is_empty() {
            return Err(malformed(format!("unexpected token '{token}'")));
        }
        if alias.is_empty() {
            let alias = rest
                .next()
                .ok_or_else(|| malformed(format!("value '{token}' has no alias")))?;
            return self.change(bits, alias);
        }
        self.change(bits, alias)
    }

    /// Split `<bits><alias>`, preferring the longest bit run that leaves a
    /// declared alias.
    fn split_scalar<'t>(&self, token: &'t str) -> (&'t str, &'t str) {
        let run = token
            .bytes()
            .take_while(|b| matches!(b, b'0' | b'1' | b'x' | b'X' | b'z' | b'Z'))
            .count();
        (1..=run)
            .rev()
            .find(|&k| self.builder.contains(&token[k..]))
            .map_or_else(|| token.split_at(run), |k| token.split_at(k))
    }

    fn change(&mut self, bits: &str, alias: &str) -> Result<(), Error> {
        if bits.is_empty() {
            return Err(malformed(format!("empty value for '{alias}'")));
        }
        let Some(width) = self.builder.width_of(alias) else {
            self.skip(Ignored::UnregisteredAlias {
                alias: alias.to_string(),
                time: self.time,
            });
            return Ok(());
        };
        if !bits.bytes().all(|b| b == b'0' || b == b'1') {
            self.skip(Ignored::NonBinaryValue {
                alias: alias.to_string(),
                time: self.time,
                value: bits.to_string(),
            });
            return Ok(());
        }

        let mut value = u64::from_str_radix(bits, 2)
            .map_err(|_| malformed(format!("value '{bits}' for '{alias}' exceeds 64 bits")))?;
        match self.options.width_policy {
            WidthPolicy::Ignore => {}
            WidthPolicy::Truncate => {
                if width < u64::BITS {
                    value &= (1u64 << width) - 1;
                }
            }
            WidthPolicy::Reject => {
                let used = u64::BITS - value.leading_zeros();
                if used > width {
                    return Err(malformed(format!(
                        "value '{bits}' is wider than the {width}-bit signal '{alias}'"
                    )));
                }
            }
        }

        self.builder
            .add_value(alias, self.time, value)
            .map_err(|e| malformed(e.to_string()))
    }

    fn skip(&mut self, record: Ignored) {
        tracing::debug!(?record, "Skipping waveform record");
        self.ignored.push(record);
    }
}

fn malformed(message: String) -> Error {
    Error::MalformedDump(message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const CLOCK: &str = "\
$date today $end
$version Icarus Verilog $end
$timescale 1ns $end
$scope module test $end
$var wire 1 a clk $end
$upscope $end
$enddefinitions $end
#0
0a
#5
1a
#10
0a
";

    fn trace(waveform: &WaveformData, id: &str) -> Vec<(u64, u64)> {
        waveform.signal(id).unwrap().trace().collect()
    }

    #[test]
    fn test_single_clock_signal() {
        let waveform = parse(CLOCK).unwrap();
        assert_eq!(waveform.time_unit(), TimeUnit::Ns);
        assert_eq!(waveform.time_scale(), 1);
        let clk = waveform.signal("a").unwrap();
        assert_eq!(clk.name(), "clk");
        assert_eq!(clk.kind(), VerilogDataType::Wire);
        assert_eq!(clk.width(), 1);
        assert_eq!(trace(&waveform, "a"), vec![(0, 0), (5, 1), (10, 0)]);
    }

    #[test]
    fn test_duplicate_time_is_malformed() {
        let dump = "$timescale 1ns $end\n$var wire 1 a clk $end\n$enddefinitions $end\n#5\n1a\n#5\n0a\n";
        let err = parse(dump).unwrap_err();
        assert_eq!(err.code(), "Parsing.MalformedDump");
        assert!(err.to_string().contains("already recorded at time 5"), "{err}");
    }

    #[test]
    fn test_vector_values_and_ranges() {
        let dump = "\
$timescale 10 ps $end
$var reg 8 \" data [7:0] $end
$var integer 32 # count $end
$enddefinitions $end
#0
$dumpvars
b00000000 \"
b0 #
$end
#20
b10100101 \"
b101 #
";
        let waveform = parse(dump).unwrap();
        assert_eq!(waveform.time_unit(), TimeUnit::Ps);
        assert_eq!(waveform.time_scale(), 10);
        assert_eq!(trace(&waveform, "\""), vec![(0, 0), (20, 0xA5)]);
        assert_eq!(trace(&waveform, "#"), vec![(0, 0), (20, 5)]);
        assert_eq!(waveform.signal("#").unwrap().kind(), VerilogDataType::Integer);
        assert_eq!(waveform.signal_by_name("data").unwrap().0, "\"");
    }

    #[test]
    fn test_missing_timescale_defaults() {
        let dump = "$var reg 1 ! q $end\n$enddefinitions $end\n#1\n1!\n";
        let waveform = parse(dump).unwrap();
        assert_eq!(waveform.time_unit(), TimeUnit::Ns);
        assert_eq!(waveform.time_scale(), 0);
        assert_eq!(trace(&waveform, "!"), vec![(1, 1)]);
    }

    #[test]
    fn test_unknown_kind_is_wire() {
        let dump = "$var parameter 4 p WIDTH $end\n$enddefinitions $end\n";
        let waveform = parse(dump).unwrap();
        assert_eq!(waveform.signal("p").unwrap().kind(), VerilogDataType::Wire);
    }

    #[test]
    fn test_invalid_declarations_are_malformed() {
        for dump in [
            "$var wire 0 a clk $end",
            "$var wire wide a clk $end",
            "$var wire 1 a $end",
            "$var wire 1 $end",
        ] {
            let err = parse(dump).unwrap_err();
            assert_eq!(err.code(), "Parsing.MalformedDump", "{dump}");
        }
    }

    #[test]
    fn test_duplicate_alias_keeps_first() {
        let dump = "\
$var wire 1 a clk $end
$var wire 1 a clk_alias $end
$enddefinitions $end
#0
1a
";
        let report = parse_with_report(dump, ParseOptions::default()).unwrap();
        assert_eq!(report.waveform.signal("a").unwrap().name(), "clk");
        assert_eq!(
            report.ignored,
            vec![Ignored::DuplicateAlias {
                alias: "a".to_string(),
                name: "clk_alias".to_string(),
            }]
        );
    }

    #[test]
    fn test_unregistered_and_non_binary_are_reported() {
        let dump = "\
$var wire 1 a clk $end
$var real 64 r temp $end
$enddefinitions $end
#0
xa
1q
r1.5 r
#3
1a
";
        let report = parse_with_report(dump, ParseOptions::default()).unwrap();
        assert_eq!(trace(&report.waveform, "a"), vec![(3, 1)]);
        assert!(report.waveform.signal("r").unwrap().is_empty());
        assert_eq!(
            report.ignored,
            vec![
                Ignored::NonBinaryValue {
                    alias: "a".to_string(),
                    time: 0,
                    value: "x".to_string(),
                },
                Ignored::UnregisteredAlias {
                    alias: "q".to_string(),
                    time: 0,
                },
                Ignored::NonBinaryValue {
                    alias: "r".to_string(),
                    time: 0,
                    value: "r1.5".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        let dump = "\
$comment $var wire 1 z ghost $end
$var wire 1 a clk $end
$enddefinitions $end
$comment 1a #99 $end
#2
1a
";
        let waveform = parse(dump).unwrap();
        assert!(waveform.signal("z").is_none());
        assert_eq!(trace(&waveform, "a"), vec![(2, 1)]);
    }

    #[test]
    fn test_digit_run_with_separate_alias() {
        let dump = "$var wire 1 a clk $end\n$enddefinitions $end\n#0\n1 a\n";
        assert_eq!(trace(&parse(dump).unwrap(), "a"), vec![(0, 1)]);
    }

    #[test]
    fn test_numeric_alias_prefers_declared_split() {
        let dump = "$var wire 1 1 clk $end\n$enddefinitions $end\n#0\n01\n#1\n11\n";
        assert_eq!(trace(&parse(dump).unwrap(), "1"), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_bad_tokens_are_malformed() {
        let header = "$var wire 1 a clk $end\n$enddefinitions $end\n";
        for body in ["#0\nb", "#0\nb1", "#zero\n1a", "#0\n?a", "#0\n1"] {
            let err = parse(&format!("{header}{body}\n")).unwrap_err();
            assert_eq!(err.code(), "Parsing.MalformedDump", "{body}");
        }
    }

    #[test]
    fn test_out_of_order_and_negative_times_are_malformed() {
        let header = "$var wire 1 a clk $end\n$enddefinitions $end\n";
        for body in ["#5\n1a\n#2\n0a", "#-1\n1a"] {
            let err = parse(&format!("{header}{body}\n")).unwrap_err();
            assert_eq!(err.code(), "Parsing.MalformedDump", "{body}");
        }
    }

    #[test]
    fn test_value_overflow_is_malformed() {
        let bits = "1".repeat(65);
        let dump = format!("$var reg 65 a big $end\n$enddefinitions $end\n#0\nb{bits} a\n");
        assert_eq!(parse(&dump).unwrap_err().code(), "Parsing.MalformedDump");
    }

    #[test]
    fn test_width_policies() {
        let dump = "$var reg 2 a q $end\n$enddefinitions $end\n#0\nb1111 a\n";

        let ignored = parse(dump).unwrap();
        assert_eq!(trace(&ignored, "a"), vec![(0, 0b1111)]);

        let truncated = parse_with_report(
            dump,
            ParseOptions::default().with_width_policy(WidthPolicy::Truncate),
        )
        .unwrap();
        assert_eq!(trace(&truncated.waveform, "a"), vec![(0, 0b11)]);

        let rejected = parse_with_report(
            dump,
            ParseOptions::default().with_width_policy(WidthPolicy::Reject),
        );
        assert_eq!(rejected.unwrap_err().code(), "Parsing.MalformedDump");

        let narrow = "$var reg 2 a q $end\n$enddefinitions $end\n#0\nb0011 a\n";
        let kept = parse_with_report(
            narrow,
            ParseOptions::default().with_width_policy(WidthPolicy::Reject),
        )
        .unwrap();
        assert_eq!(trace(&kept.waveform, "a"), vec![(0, 3)]);
    }

    #[test]
    fn test_without_enddefinitions_whole_text_is_body() {
        let dump = "$timescale 1 us $end $var wire 1 a clk $end #0 1a #4 0a";
        let waveform = parse(dump).unwrap();
        assert_eq!(waveform.time_unit(), TimeUnit::Us);
        assert_eq!(trace(&waveform, "a"), vec![(0, 1), (4, 0)]);
    }
}
