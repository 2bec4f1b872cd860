//! Text frame codec for the ensemble wire protocol.
//!
//! A frame is a sequence of fields, each terminated by [`FIELD_TERMINATOR`]:
//! `address, types, timestamp, reliable-flag`, then one field per character
//! of the type string, in declared order. Values must be added and read in
//! exactly that order; the cursor checks make marshalling mirror the type
//! string, which is the protocol's core correctness property.

use thiserror::Error;

/// Control byte ending every field. Not legal inside field contents.
pub const FIELD_TERMINATOR: char = '\u{0003}';

/// Valid parameter type characters.
pub const TYPE_CHARS: &str = "dfihsSt";

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("type mismatch: declared '{declared}', accessed as '{accessed}'")]
    TypeMismatch { declared: char, accessed: char },
    #[error("read or write past the declared type count")]
    OutOfSequence,
    #[error("finish() called before all declared values were added")]
    Incomplete,
    #[error("no handler registered for address {0:?}")]
    UnknownAddress(String),
    #[error("typestring {got:?} does not match handler's {expected:?} for {address:?}")]
    TypestringMismatch {
        address: String,
        expected: String,
        got: String,
    },
}

/// Result of parsing one inbound frame.
#[derive(Debug)]
pub enum Decoded {
    Frame(WireMessage),
    /// A frame of exactly one empty terminated field. Heartbeat, to be
    /// ignored by the receiver.
    Nop,
}

fn push_field(buf: &mut String, field: &str) {
    buf.push_str(field);
    buf.push(FIELD_TERMINATOR);
}

/// Builder for outbound frames. One `add_*` call per type character, in
/// order, then [`MessageBuilder::finish`].
#[derive(Debug)]
pub struct MessageBuilder {
    types: Vec<char>,
    cursor: usize,
    buf: String,
}

impl MessageBuilder {
    pub fn begin(address: &str, timestamp: f64, types: &str, reliable: bool) -> Self {
        let mut buf = String::new();
        push_field(&mut buf, address);
        push_field(&mut buf, types);
        push_field(&mut buf, &format!("{:.4}", timestamp));
        push_field(&mut buf, if reliable { "T" } else { "F" });
        Self {
            types: types.chars().collect(),
            cursor: 0,
            buf,
        }
    }

    fn expect(&mut self, accessed: char) -> Result<(), ProtocolError> {
        match self.types.get(self.cursor) {
            None => Err(ProtocolError::OutOfSequence),
            Some(&declared) if declared != accessed => {
                Err(ProtocolError::TypeMismatch { declared, accessed })
            }
            Some(_) => Ok(()),
        }
    }

    fn add_raw(&mut self, accessed: char, field: &str) -> Result<(), ProtocolError> {
        self.expect(accessed)?;
        push_field(&mut self.buf, field);
        self.cursor += 1;
        Ok(())
    }

    /// Full text precision, unlike time values.
    pub fn add_double(&mut self, v: f64) -> Result<(), ProtocolError> {
        self.add_raw('d', &v.to_string())
    }

    pub fn add_float(&mut self, v: f32) -> Result<(), ProtocolError> {
        self.add_raw('f', &v.to_string())
    }

    pub fn add_int32(&mut self, v: i32) -> Result<(), ProtocolError> {
        self.add_raw('i', &v.to_string())
    }

    pub fn add_int64(&mut self, v: i64) -> Result<(), ProtocolError> {
        self.add_raw('h', &v.to_string())
    }

    /// The terminator byte in `v` is a caller precondition violation;
    /// strings are not escaped on the wire.
    pub fn add_string(&mut self, v: &str) -> Result<(), ProtocolError> {
        self.add_raw('s', v)
    }

    pub fn add_symbol(&mut self, v: &str) -> Result<(), ProtocolError> {
        self.add_raw('S', v)
    }

    /// Truncated to 4 decimals for scheduling granularity.
    pub fn add_time(&mut self, v: f64) -> Result<(), ProtocolError> {
        self.add_raw('t', &format!("{:.4}", v))
    }

    pub fn finish(self) -> Result<String, ProtocolError> {
        if self.cursor != self.types.len() {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.buf)
    }
}

/// Typed parameter for [`compose`].
#[derive(Debug, Clone)]
pub enum Param {
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    Str(String),
    Symbol(String),
    Time(f64),
}

/// One-shot encode of a complete frame. Fails when `params` does not match
/// `types` position for position.
pub fn compose(
    address: &str,
    timestamp: f64,
    types: &str,
    reliable: bool,
    params: &[Param],
) -> Result<String, ProtocolError> {
    let mut builder = MessageBuilder::begin(address, timestamp, types, reliable);
    for param in params {
        match param {
            Param::Double(v) => builder.add_double(*v)?,
            Param::Float(v) => builder.add_float(*v)?,
            Param::Int(v) => builder.add_int32(*v)?,
            Param::Long(v) => builder.add_int64(*v)?,
            Param::Str(v) => builder.add_string(v)?,
            Param::Symbol(v) => builder.add_symbol(v)?,
            Param::Time(v) => builder.add_time(*v)?,
        }
    }
    builder.finish()
}

/// A parsed inbound frame. Parameter fields stay as text until requested
/// through the typed getters, which enforce the declared order.
#[derive(Debug)]
pub struct WireMessage {
    pub address: String,
    pub types: String,
    pub timestamp: f64,
    pub reliable: bool,
    params: Vec<String>,
    type_chars: Vec<char>,
    cursor: usize,
}

pub fn parse(frame: &str) -> Result<Decoded, ProtocolError> {
    let mut fields: Vec<&str> = frame.split(FIELD_TERMINATOR).collect();
    // Fields are terminated, not separated: a well-formed frame ends with
    // the terminator and splitting leaves one trailing empty element.
    match fields.pop() {
        Some("") => {}
        _ => {
            return Err(ProtocolError::MalformedMessage(
                "frame does not end with the field terminator".into(),
            ))
        }
    }
    if fields.len() == 1 && fields[0].is_empty() {
        return Ok(Decoded::Nop);
    }
    if fields.len() < 4 {
        return Err(ProtocolError::MalformedMessage(format!(
            "expected at least 4 header fields, got {}",
            fields.len()
        )));
    }
    let address = fields[0].to_string();
    let types = fields[1].to_string();
    if let Some(bad) = types.chars().find(|c| !TYPE_CHARS.contains(*c)) {
        return Err(ProtocolError::MalformedMessage(format!(
            "unknown type character {:?}",
            bad
        )));
    }
    let timestamp: f64 = fields[2]
        .parse()
        .map_err(|_| ProtocolError::MalformedMessage(format!("bad timestamp {:?}", fields[2])))?;
    let reliable = match fields[3] {
        "T" => true,
        "F" => false,
        other => {
            return Err(ProtocolError::MalformedMessage(format!(
                "bad reliable flag {:?}",
                other
            )))
        }
    };
    if fields.len() != 4 + types.chars().count() {
        return Err(ProtocolError::MalformedMessage(format!(
            "field count {} does not match 4 + {} declared types",
            fields.len(),
            types.chars().count()
        )));
    }
    let params = fields[4..].iter().map(|f| f.to_string()).collect();
    let type_chars = types.chars().collect();
    Ok(Decoded::Frame(WireMessage {
        address,
        types,
        timestamp,
        reliable,
        params,
        type_chars,
        cursor: 0,
    }))
}

impl WireMessage {
    fn next_raw(&mut self, accessed: char) -> Result<&str, ProtocolError> {
        match self.type_chars.get(self.cursor) {
            None => Err(ProtocolError::OutOfSequence),
            Some(&declared) if declared != accessed => {
                Err(ProtocolError::TypeMismatch { declared, accessed })
            }
            Some(_) => {
                let field = &self.params[self.cursor];
                self.cursor += 1;
                Ok(field)
            }
        }
    }

    fn parse_numeric<T: std::str::FromStr>(field: &str) -> Result<T, ProtocolError> {
        field
            .parse()
            .map_err(|_| ProtocolError::MalformedMessage(format!("bad numeric field {:?}", field)))
    }

    pub fn get_double(&mut self) -> Result<f64, ProtocolError> {
        let field = self.next_raw('d')?;
        Self::parse_numeric(field)
    }

    pub fn get_float(&mut self) -> Result<f32, ProtocolError> {
        let field = self.next_raw('f')?;
        Self::parse_numeric(field)
    }

    pub fn get_int32(&mut self) -> Result<i32, ProtocolError> {
        let field = self.next_raw('i')?;
        Self::parse_numeric(field)
    }

    pub fn get_int64(&mut self) -> Result<i64, ProtocolError> {
        let field = self.next_raw('h')?;
        Self::parse_numeric(field)
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        Ok(self.next_raw('s')?.to_string())
    }

    pub fn get_symbol(&mut self) -> Result<String, ProtocolError> {
        Ok(self.next_raw('S')?.to_string())
    }

    pub fn get_time(&mut self) -> Result<f64, ProtocolError> {
        let field = self.next_raw('t')?;
        Self::parse_numeric(field)
    }
}

impl std::fmt::Display for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} time={} \"{}\" {}",
            self.address,
            self.timestamp,
            self.types,
            if self.reliable { "rel" } else { "unrel" }
        )?;
        for param in &self.params {
            write!(f, " |{}", param)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_frame(decoded: Decoded) -> WireMessage {
        match decoded {
            Decoded::Frame(msg) => msg,
            Decoded::Nop => panic!("expected a frame, got NOP"),
        }
    }

    #[test]
    fn round_trip_all_types() {
        let mut b = MessageBuilder::begin("/gdc/everything", 12.34567, "dfihsSt", true);
        b.add_double(0.1234567890123).unwrap();
        b.add_float(2.5).unwrap();
        b.add_int32(-7).unwrap();
        b.add_int64(1_234_567_890_123).unwrap();
        b.add_string("hello there").unwrap();
        b.add_symbol("sym").unwrap();
        b.add_time(9.87654).unwrap();
        let frame = b.finish().unwrap();

        let mut msg = must_frame(parse(&frame).unwrap());
        assert_eq!(msg.address, "/gdc/everything");
        assert_eq!(msg.types, "dfihsSt");
        // Header timestamp carries 4-decimal precision.
        assert!((msg.timestamp - 12.3457).abs() < 1e-9);
        assert!(msg.reliable);
        assert_eq!(msg.get_double().unwrap(), 0.1234567890123);
        assert_eq!(msg.get_float().unwrap(), 2.5);
        assert_eq!(msg.get_int32().unwrap(), -7);
        assert_eq!(msg.get_int64().unwrap(), 1_234_567_890_123);
        assert_eq!(msg.get_string().unwrap(), "hello there");
        assert_eq!(msg.get_symbol().unwrap(), "sym");
        // Time values are truncated to 4 decimals by design.
        assert!((msg.get_time().unwrap() - 9.8765).abs() < 1e-9);
    }

    #[test]
    fn frame_layout_is_terminated_fields() {
        let mut b = MessageBuilder::begin("/a", 0.0, "i", false);
        b.add_int32(5).unwrap();
        let frame = b.finish().unwrap();
        assert_eq!(frame, "/a\u{3}i\u{3}0.0000\u{3}F\u{3}5\u{3}");
    }

    #[test]
    fn wrong_type_is_type_mismatch() {
        let mut b = MessageBuilder::begin("/a", 0.0, "is", true);
        assert_eq!(
            b.add_string("oops"),
            Err(ProtocolError::TypeMismatch {
                declared: 'i',
                accessed: 's'
            })
        );
        // The failed call must not advance the cursor.
        b.add_int32(1).unwrap();
        b.add_string("ok").unwrap();
        b.finish().unwrap();
    }

    #[test]
    fn past_the_end_is_out_of_sequence() {
        let mut b = MessageBuilder::begin("/a", 0.0, "i", true);
        b.add_int32(1).unwrap();
        assert_eq!(b.add_int32(2), Err(ProtocolError::OutOfSequence));
    }

    #[test]
    fn finish_before_complete_is_incomplete() {
        let b = MessageBuilder::begin("/a", 0.0, "ii", true);
        assert_eq!(b.finish(), Err(ProtocolError::Incomplete));
    }

    #[test]
    fn getters_enforce_declared_order() {
        let frame = compose("/a", 0.0, "it", true, &[Param::Int(3), Param::Time(1.5)]).unwrap();
        let mut msg = must_frame(parse(&frame).unwrap());
        assert_eq!(
            msg.get_time(),
            Err(ProtocolError::TypeMismatch {
                declared: 'i',
                accessed: 't'
            })
        );
        assert_eq!(msg.get_int32().unwrap(), 3);
        assert_eq!(msg.get_time().unwrap(), 1.5);
        assert_eq!(msg.get_int32(), Err(ProtocolError::OutOfSequence));
    }

    #[test]
    fn nop_frame_is_ignored_not_an_error() {
        match parse("\u{3}").unwrap() {
            Decoded::Nop => {}
            Decoded::Frame(msg) => panic!("NOP decoded as frame {}", msg),
        }
    }

    #[test]
    fn field_count_mismatch_is_malformed() {
        // Declares two ints but carries one parameter field.
        let frame = "/a\u{3}ii\u{3}0.0000\u{3}T\u{3}1\u{3}";
        assert!(matches!(
            parse(frame),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn missing_final_terminator_is_malformed() {
        assert!(matches!(
            parse("/a\u{3}i\u{3}0.0000\u{3}T\u{3}5"),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn unknown_type_character_is_malformed() {
        assert!(matches!(
            parse("/a\u{3}q\u{3}0.0000\u{3}T\u{3}1\u{3}"),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn bad_reliable_flag_is_malformed() {
        assert!(matches!(
            parse("/a\u{3}\u{3}0.0000\u{3}X\u{3}"),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn doubles_keep_full_text_precision() {
        let frame = compose(
            "/a",
            0.0,
            "d",
            true,
            &[Param::Double(0.000123456789012345)],
        )
        .unwrap();
        let mut msg = must_frame(parse(&frame).unwrap());
        assert_eq!(msg.get_double().unwrap(), 0.000123456789012345);
    }

    #[test]
    fn compose_rejects_param_type_drift() {
        let err = compose("/a", 0.0, "i", true, &[Param::Str("x".into())]);
        assert_eq!(
            err,
            Err(ProtocolError::TypeMismatch {
                declared: 'i',
                accessed: 's'
            })
        );
    }
}
