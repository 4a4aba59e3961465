//! Raw binder transactions through the platform `service call` tool.
//!
//! Hidden system-service methods are reached by transaction code; the
//! argument layout mirrors the AIDL signature and is an external contract.
use crate::error::TriggerError;

/// `'BNDL'`, the header word of a Java-written `Bundle`.
const BUNDLE_MAGIC: i32 = 0x4C44_4E42;

// `Parcel.writeValue` type tags.
const VAL_INTEGER: i32 = 1;
const VAL_LONG: i32 = 6;
const VAL_BOOLEAN: i32 = 9;

/// A value stored in a [`ParcelArg::Bundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleValue {
    Int(i32),
    Long(i64),
    Bool(bool),
}

impl BundleValue {
    fn tag(self) -> i32 {
        match self {
            BundleValue::Int(_) => VAL_INTEGER,
            BundleValue::Long(_) => VAL_LONG,
            BundleValue::Bool(_) => VAL_BOOLEAN,
        }
    }

    /// Bytes taken by the tag word plus the value.
    fn size(self) -> usize {
        4 + match self {
            BundleValue::Long(_) => 8,
            BundleValue::Int(_) | BundleValue::Bool(_) => 4,
        }
    }

    fn as_arg(self) -> ParcelArg {
        match self {
            BundleValue::Int(v) => ParcelArg::I32(v),
            BundleValue::Long(v) => ParcelArg::I64(v),
            BundleValue::Bool(v) => ParcelArg::I32(i32::from(v)),
        }
    }
}

/// One argument of a `service call` transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParcelArg {
    /// A null strong binder. Not a valid null for a parcelable argument:
    /// the stub reads the binder header as "present".
    Null,
    I32(i32),
    I64(i64),
    /// A UTF-16 string.
    S16(String),
    /// A non-null `Bundle` in the layout `Bundle.writeToParcel` produces,
    /// preceded by the typed-object presence word.
    Bundle(Vec<(String, BundleValue)>),
}

impl ParcelArg {
    fn render(&self) -> String {
        match self {
            ParcelArg::Null => "null".to_string(),
            ParcelArg::I32(v) => format!("i32 {v}"),
            ParcelArg::I64(v) => format!("i64 {v}"),
            ParcelArg::S16(s) => format!("s16 {}", shell_quote(s)),
            ParcelArg::Bundle(entries) => {
                let payload = 4 + entries
                    .iter()
                    .map(|(key, value)| string16_size(key) + value.size())
                    .sum::<usize>();
                let mut args = vec![
                    ParcelArg::I32(1),
                    ParcelArg::I32(payload as i32),
                    ParcelArg::I32(BUNDLE_MAGIC),
                    ParcelArg::I32(entries.len() as i32),
                ];
                for (key, value) in entries {
                    args.push(ParcelArg::S16(key.clone()));
                    args.push(ParcelArg::I32(value.tag()));
                    args.push(value.as_arg());
                }
                args.iter().map(ParcelArg::render).collect::<Vec<_>>().join(" ")
            }
        }
    }
}

/// Length word plus NUL-terminated UTF-16 data, padded to 4 bytes.
fn string16_size(s: &str) -> usize {
    let data = (s.encode_utf16().count() + 1) * 2;
    4 + data.next_multiple_of(4)
}

/// Builds the shell command line for `service call <service> <code> <args…>`.
pub fn service_call(service: &str, code: u32, args: &[ParcelArg]) -> String {
    let mut command = format!("service call {service} {code}");
    for arg in args {
        command.push(' ');
        command.push_str(&arg.render());
    }
    command
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Decoded reply words of a `service call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelReply {
    words: Vec<u32>,
}

impl ParcelReply {
    /// Parses `service call` output such as
    ///
    /// ```text
    /// Result: Parcel(00000000 00000001   '........')
    /// ```
    ///
    /// or its multi-line `0x…:` form. Only the hex words before the ASCII
    /// column of each line are kept.
    pub fn parse(text: &str) -> Result<Self, TriggerError> {
        if text.contains("does not exist") || text.contains("Can't find service") {
            return Err(TriggerError::ServiceUnavailable(first_line(text)));
        }
        let start = text
            .find("Parcel(")
            .ok_or_else(|| TriggerError::ReflectionFailure(format!("unexpected reply: {}", first_line(text))))?;

        let words: Vec<u32> = text[start + "Parcel(".len()..]
            .lines()
            .flat_map(|line| {
                let hex = line.split('\'').next().unwrap_or("");
                hex.split_whitespace()
                    .filter(|t| t.len() == 8)
                    .filter_map(|t| u32::from_str_radix(t, 16).ok())
                    .collect::<Vec<_>>()
            })
            .collect();

        if words.is_empty() {
            return Err(TriggerError::ReflectionFailure("empty reply parcel".into()));
        }
        Ok(Self { words })
    }

    /// The leading status word; 0 means no exception.
    pub fn exception_code(&self) -> i32 {
        self.words[0] as i32
    }

    pub fn check(&self) -> Result<(), TriggerError> {
        match self.exception_code() {
            0 => Ok(()),
            code => Err(TriggerError::ReflectionFailure(format!("remote exception {code}"))),
        }
    }

    /// Result of a method returning `boolean`.
    pub fn bool_result(&self) -> Result<bool, TriggerError> {
        self.check()?;
        Ok(self.words.get(1).is_some_and(|w| *w != 0))
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_service_call_command() {
        let cmd = service_call(
            "voiceinteraction",
            3,
            &[
                ParcelArg::Null,
                ParcelArg::I32(0),
                ParcelArg::I32(7),
                ParcelArg::S16("hyperOS_home".into()),
            ],
        );
        assert_eq!(cmd, "service call voiceinteraction 3 null i32 0 i32 7 s16 'hyperOS_home'");
    }

    #[test]
    fn empty_bundle_is_header_only() {
        assert_eq!(
            service_call("x", 1, &[ParcelArg::Bundle(Vec::new())]),
            "service call x 1 i32 1 i32 4 i32 1279544898 i32 0"
        );
    }

    #[test]
    fn bundle_length_counts_padded_keys_and_values() {
        // count 4; "abc" 4 + 8, int 8; "ab" 4 + 8 (6 padded), long 12;
        // "z" 4 + 4, bool 8.
        let bundle = ParcelArg::Bundle(vec![
            ("abc".into(), BundleValue::Int(5)),
            ("ab".into(), BundleValue::Long(-1)),
            ("z".into(), BundleValue::Bool(true)),
        ]);
        assert_eq!(
            service_call("x", 2, &[bundle]),
            "service call x 2 i32 1 i32 64 i32 1279544898 i32 3 \
             s16 'abc' i32 1 i32 5 s16 'ab' i32 6 i64 -1 s16 'z' i32 9 i32 1"
        );
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        let cmd = service_call("x", 1, &[ParcelArg::S16("it's".into()), ParcelArg::I64(-2)]);
        assert_eq!(cmd, r"service call x 1 s16 'it'\''s' i64 -2");
    }

    #[test]
    fn parses_true_reply() {
        let reply = ParcelReply::parse("Result: Parcel(00000000 00000001   '........')").unwrap();
        assert_eq!(reply.exception_code(), 0);
        assert!(reply.bool_result().unwrap());
    }

    #[test]
    fn parses_false_reply() {
        let reply = ParcelReply::parse("Result: Parcel(00000000 00000000   '........')\n").unwrap();
        assert!(!reply.bool_result().unwrap());
    }

    #[test]
    fn void_reply_passes_check() {
        let reply = ParcelReply::parse("Result: Parcel(00000000    '....')").unwrap();
        assert!(reply.check().is_ok());
        assert!(!reply.bool_result().unwrap());
    }

    #[test]
    fn parses_multiline_exception_reply() {
        let text = "Result: Parcel(\n  0x00000000: ffffffff 00000042 00740041 00650074 '....B...A.t.t.e.'\n  0x00000010: 0070006d 00200074 006f0074 00690020 'm.p.t. .t.o. .i.')\n";
        let reply = ParcelReply::parse(text).unwrap();
        assert_eq!(reply.exception_code(), -1);
        assert!(matches!(reply.check(), Err(TriggerError::ReflectionFailure(_))));
        assert!(reply.bool_result().is_err());
    }

    #[test]
    fn missing_service_is_unavailable() {
        let err = ParcelReply::parse("service: Service contextual_search does not exist").unwrap_err();
        assert!(matches!(err, TriggerError::ServiceUnavailable(_)));
    }

    #[test]
    fn garbage_is_reflection_failure() {
        assert!(matches!(
            ParcelReply::parse("/system/bin/sh: service: not found"),
            Err(TriggerError::ReflectionFailure(_))
        ));
        assert!(matches!(
            ParcelReply::parse("Result: Parcel()"),
            Err(TriggerError::ReflectionFailure(_))
        ));
    }
}
