//! Protocol message definitions
//!
//! Defines every message exchanged between a turret client and server,
//! and the validation each one performs when it is built or decoded.

use rmpv::Value;
use thiserror::Error;

/// Key carrying the variant tag in every encoded message
pub const TYPE_KEY: &str = "type";

/// Largest integer magnitude an `f64` represents exactly (2^53)
const MAX_EXACT_FLOAT_INT: u64 = 1 << 53;

/// Message model errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("No message type provided")]
    MissingType,

    #[error("Expected message type [{expected}], got [{found}]")]
    UnexpectedType { expected: &'static str, found: String },

    #[error("Unknown message type [{0}]")]
    UnknownType(String),

    #[error("Missing [{0}] in message")]
    MissingField(&'static str),

    #[error("[{field}] must be {expected}, got [{found}]")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i128,
        min: i128,
        max: i128,
    },
}

impl MessageError {
    /// The tag was missing or named a different variant
    pub fn is_type_error(&self) -> bool {
        matches!(
            self,
            MessageError::MissingType
                | MessageError::UnexpectedType { .. }
                | MessageError::UnknownType(_)
        )
    }

    /// A field of a correctly tagged message was missing or mis-typed
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            MessageError::MissingField(_) | MessageError::InvalidField { .. }
        )
    }

    /// A field value violated its documented range
    pub fn is_validation_error(&self) -> bool {
        matches!(self, MessageError::OutOfRange { .. })
    }
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Ordered key/value view of a message, as carried on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMap {
    entries: Vec<(Value, Value)>,
}

impl MessageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a map holding only the `"type"` tag
    pub fn tagged(tag: &'static str) -> Self {
        Self::new().with(TYPE_KEY, tag)
    }

    /// Append a string-keyed entry
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.entries.push((Value::from(key), value.into()));
        self
    }

    /// Look up a string key. Later duplicates shadow earlier ones.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// The raw `"type"` entry, if any
    pub fn tag(&self) -> Option<&Value> {
        self.get(TYPE_KEY)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl From<Vec<(Value, Value)>> for MessageMap {
    fn from(entries: Vec<(Value, Value)>) -> Self {
        Self { entries }
    }
}

impl From<MessageMap> for Value {
    fn from(map: MessageMap) -> Self {
        Value::Map(map.entries)
    }
}

/// A single protocol variant with a fixed wire tag.
///
/// `from_map` checks the tag before looking at any field, so a caller can
/// tell a message of the wrong kind apart from a malformed one of the
/// right kind.
pub trait WireMessage: Sized + Into<Message> {
    /// Value of the `"type"` key for this variant
    const TAG: &'static str;

    /// Build the wire map: tag first, then fields
    fn to_map(&self) -> MessageMap;

    /// Parse and validate a wire map
    fn from_map(map: &MessageMap) -> MessageResult<Self>;
}

fn describe(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| value.to_string())
}

fn check_type(map: &MessageMap, expected: &'static str) -> MessageResult<()> {
    let tag = map.tag().ok_or(MessageError::MissingType)?;
    if tag.as_str() == Some(expected) {
        Ok(())
    } else {
        Err(MessageError::UnexpectedType {
            expected,
            found: describe(tag),
        })
    }
}

fn field<'a>(map: &'a MessageMap, name: &'static str) -> MessageResult<&'a Value> {
    map.get(name).ok_or(MessageError::MissingField(name))
}

fn invalid(field: &'static str, expected: &'static str, found: &Value) -> MessageError {
    MessageError::InvalidField {
        field,
        expected,
        found: describe(found),
    }
}

fn get_float(map: &MessageMap, name: &'static str) -> MessageResult<f64> {
    match field(map, name)? {
        Value::F64(v) => Ok(*v),
        Value::F32(v) => Ok(f64::from(*v)),
        other => Err(invalid(name, "a float", other)),
    }
}

/// Like `get_float`, but whole numbers are widened when exact
fn get_float_or_int(map: &MessageMap, name: &'static str) -> MessageResult<f64> {
    match field(map, name)? {
        Value::Integer(n) => {
            let exact = n
                .as_i64()
                .filter(|v| v.unsigned_abs() <= MAX_EXACT_FLOAT_INT)
                .map(|v| v as f64)
                .or_else(|| {
                    n.as_u64()
                        .filter(|v| *v <= MAX_EXACT_FLOAT_INT)
                        .map(|v| v as f64)
                });
            exact.ok_or_else(|| invalid(name, "an exactly representable number", &Value::Integer(*n)))
        }
        _ => get_float(map, name),
    }
}

fn get_int(map: &MessageMap, name: &'static str) -> MessageResult<i128> {
    match field(map, name)? {
        Value::Integer(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .ok_or_else(|| invalid(name, "an integer", &Value::Integer(*n))),
        other => Err(invalid(name, "an integer", other)),
    }
}

fn check_range(field: &'static str, value: i128, min: i128, max: i128) -> MessageResult<i128> {
    if value < min || value > max {
        return Err(MessageError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// Rotate the turret to an absolute base/elevation pose
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move {
    base_angle: f64,
    elev_angle: f64,
}

impl Move {
    /// Angles are not range-checked; the turret enforces its own limits
    pub fn new(base_angle: f64, elev_angle: f64) -> Self {
        Self {
            base_angle,
            elev_angle,
        }
    }

    pub fn base_angle(&self) -> f64 {
        self.base_angle
    }

    pub fn elev_angle(&self) -> f64 {
        self.elev_angle
    }
}

impl WireMessage for Move {
    const TAG: &'static str = "move";

    fn to_map(&self) -> MessageMap {
        MessageMap::tagged(Self::TAG)
            .with("base_angle", self.base_angle)
            .with("elev_angle", self.elev_angle)
    }

    fn from_map(map: &MessageMap) -> MessageResult<Self> {
        check_type(map, Self::TAG)?;
        let base_angle = get_float(map, "base_angle")?;
        let elev_angle = get_float(map, "elev_angle")?;
        Ok(Self::new(base_angle, elev_angle))
    }
}

/// Fire the turret a number of times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shoot {
    times: u32,
}

impl Shoot {
    pub fn new(times: i64) -> MessageResult<Self> {
        Self::checked(i128::from(times))
    }

    /// A single shot, the default for a fire command
    pub fn once() -> Self {
        Self { times: 1 }
    }

    fn checked(times: i128) -> MessageResult<Self> {
        let times = check_range("times", times, 0, i128::from(u32::MAX))?;
        Ok(Self { times: times as u32 })
    }

    pub fn times(&self) -> u32 {
        self.times
    }
}

impl Default for Shoot {
    fn default() -> Self {
        Self::once()
    }
}

impl WireMessage for Shoot {
    const TAG: &'static str = "shoot";

    fn to_map(&self) -> MessageMap {
        MessageMap::tagged(Self::TAG).with("times", self.times)
    }

    fn from_map(map: &MessageMap) -> MessageResult<Self> {
        check_type(map, Self::TAG)?;
        Self::checked(get_int(map, "times")?)
    }
}

/// Server reply announcing its TCP command port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    port: u16,
}

impl Address {
    pub fn new(port: i64) -> MessageResult<Self> {
        Self::checked(i128::from(port))
    }

    fn checked(port: i128) -> MessageResult<Self> {
        let port = check_range("port", port, 1, i128::from(u16::MAX))?;
        Ok(Self { port: port as u16 })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl WireMessage for Address {
    const TAG: &'static str = "address";

    fn to_map(&self) -> MessageMap {
        MessageMap::tagged(Self::TAG).with("port", self.port)
    }

    fn from_map(map: &MessageMap) -> MessageResult<Self> {
        check_type(map, Self::TAG)?;
        Self::checked(get_int(map, "port")?)
    }
}

/// Current turret pose and shot counter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    base_angle: f64,
    elev_angle: f64,
    shots: u32,
}

impl Status {
    /// Angles accept any type that widens losslessly to `f64`, so whole
    /// numbers such as `90` become `90.0`.
    pub fn new(
        base_angle: impl Into<f64>,
        elev_angle: impl Into<f64>,
        shots: i64,
    ) -> MessageResult<Self> {
        Self::checked(base_angle.into(), elev_angle.into(), i128::from(shots))
    }

    fn checked(base_angle: f64, elev_angle: f64, shots: i128) -> MessageResult<Self> {
        let shots = check_range("shots", shots, 0, i128::from(u32::MAX))?;
        Ok(Self {
            base_angle,
            elev_angle,
            shots: shots as u32,
        })
    }

    pub fn base_angle(&self) -> f64 {
        self.base_angle
    }

    pub fn elev_angle(&self) -> f64 {
        self.elev_angle
    }

    pub fn shots(&self) -> u32 {
        self.shots
    }
}

impl WireMessage for Status {
    const TAG: &'static str = "status";

    // The elevation key differs from the field name on purpose: servers
    // in the field send `elevation_angle`.
    fn to_map(&self) -> MessageMap {
        MessageMap::tagged(Self::TAG)
            .with("base_angle", self.base_angle)
            .with("elevation_angle", self.elev_angle)
            .with("shots", self.shots)
    }

    fn from_map(map: &MessageMap) -> MessageResult<Self> {
        check_type(map, Self::TAG)?;
        let base_angle = get_float_or_int(map, "base_angle")?;
        let elev_angle = get_float_or_int(map, "elevation_angle")?;
        let shots = get_int(map, "shots")?;
        Self::checked(base_angle, elev_angle, shots)
    }
}

/// Defines a message with no fields beyond its tag.
macro_rules! unit_message {
    ($(#[$doc:meta])* $name:ident => $tag:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl WireMessage for $name {
            const TAG: &'static str = $tag;

            fn to_map(&self) -> MessageMap {
                MessageMap::tagged(Self::TAG)
            }

            fn from_map(map: &MessageMap) -> MessageResult<Self> {
                check_type(map, Self::TAG)?;
                Ok(Self)
            }
        }
    };
}

unit_message! {
    /// Server confirmation of a command
    Acknowledge => "acknowledge"
}

unit_message! {
    /// Broadcast probe looking for a turret server
    Discover => "discover"
}

unit_message! {
    /// Ask the server for its current [`Status`]
    RequestStatus => "statusrequest"
}

unit_message! {
    /// Return the turret to its home pose
    Reset => "reset"
}

/// All protocol messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    Move(Move),
    Shoot(Shoot),
    Acknowledge(Acknowledge),
    Discover(Discover),
    Address(Address),
    RequestStatus(RequestStatus),
    Status(Status),
    Reset(Reset),
}

impl Message {
    /// Get the wire tag of this message
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Move(_) => Move::TAG,
            Message::Shoot(_) => Shoot::TAG,
            Message::Acknowledge(_) => Acknowledge::TAG,
            Message::Discover(_) => Discover::TAG,
            Message::Address(_) => Address::TAG,
            Message::RequestStatus(_) => RequestStatus::TAG,
            Message::Status(_) => Status::TAG,
            Message::Reset(_) => Reset::TAG,
        }
    }

    pub fn to_map(&self) -> MessageMap {
        match self {
            Message::Move(m) => m.to_map(),
            Message::Shoot(m) => m.to_map(),
            Message::Acknowledge(m) => m.to_map(),
            Message::Discover(m) => m.to_map(),
            Message::Address(m) => m.to_map(),
            Message::RequestStatus(m) => m.to_map(),
            Message::Status(m) => m.to_map(),
            Message::Reset(m) => m.to_map(),
        }
    }

    /// Parse whichever variant the `"type"` tag names
    pub fn from_map(map: &MessageMap) -> MessageResult<Self> {
        let tag = map.tag().ok_or(MessageError::MissingType)?;
        match tag.as_str() {
            Some(Move::TAG) => Move::from_map(map).map(Message::Move),
            Some(Shoot::TAG) => Shoot::from_map(map).map(Message::Shoot),
            Some(Acknowledge::TAG) => Acknowledge::from_map(map).map(Message::Acknowledge),
            Some(Discover::TAG) => Discover::from_map(map).map(Message::Discover),
            Some(Address::TAG) => Address::from_map(map).map(Message::Address),
            Some(RequestStatus::TAG) => RequestStatus::from_map(map).map(Message::RequestStatus),
            Some(Status::TAG) => Status::from_map(map).map(Message::Status),
            Some(Reset::TAG) => Reset::from_map(map).map(Message::Reset),
            _ => Err(MessageError::UnknownType(describe(tag))),
        }
    }

    /// Check if the server answers this message with an [`Acknowledge`]
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            Message::Move(_) | Message::Shoot(_) | Message::Reset(_)
        )
    }
}

impl From<Move> for Message {
    fn from(m: Move) -> Self {
        Message::Move(m)
    }
}

impl From<Shoot> for Message {
    fn from(m: Shoot) -> Self {
        Message::Shoot(m)
    }
}

impl From<Acknowledge> for Message {
    fn from(m: Acknowledge) -> Self {
        Message::Acknowledge(m)
    }
}

impl From<Discover> for Message {
    fn from(m: Discover) -> Self {
        Message::Discover(m)
    }
}

impl From<Address> for Message {
    fn from(m: Address) -> Self {
        Message::Address(m)
    }
}

impl From<RequestStatus> for Message {
    fn from(m: RequestStatus) -> Self {
        Message::RequestStatus(m)
    }
}

impl From<Status> for Message {
    fn from(m: Status) -> Self {
        Message::Status(m)
    }
}

impl From<Reset> for Message {
    fn from(m: Reset) -> Self {
        Message::Reset(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_map_keys() {
        let map = Move::new(10.0, 5.0).to_map();
        let keys: Vec<_> = map.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["type", "base_angle", "elev_angle"]);
        assert_eq!(map.get("base_angle"), Some(&Value::F64(10.0)));
    }

    #[test]
    fn test_status_uses_elevation_angle_key() {
        let map = Status::new(1.5, 2.5, 3).unwrap().to_map();
        assert_eq!(map.get("elevation_angle"), Some(&Value::F64(2.5)));
        assert!(map.get("elev_angle").is_none());
    }

    #[test]
    fn test_constructor_constraints() {
        assert!(Shoot::new(-1).unwrap_err().is_validation_error());
        assert!(Address::new(0).unwrap_err().is_validation_error());
        assert!(Address::new(65_536).unwrap_err().is_validation_error());
        assert!(Status::new(0.0, 0.0, -1).unwrap_err().is_validation_error());

        assert_eq!(Shoot::new(0).unwrap().times(), 0);
        assert_eq!(Address::new(1).unwrap().port(), 1);
    }

    #[test]
    fn test_status_integer_angles_coerced() {
        let from_ints = Status::new(90, 45, 2).unwrap();
        let from_floats = Status::new(90.0, 45.0, 2).unwrap();
        assert_eq!(from_ints.base_angle(), 90.0);
        assert_eq!(from_ints, from_floats);
        assert_eq!(from_ints.to_map(), from_floats.to_map());
    }

    #[test]
    fn test_tag_checked_before_fields() {
        // Wrong tag and no fields: the tag error wins
        let map = MessageMap::tagged("shoot");
        let err = Move::from_map(&map).unwrap_err();
        assert_eq!(
            err,
            MessageError::UnexpectedType {
                expected: "move",
                found: "shoot".to_string(),
            }
        );

        let err = Move::from_map(&MessageMap::new().with("base_angle", 1.0)).unwrap_err();
        assert_eq!(err, MessageError::MissingType);
        assert!(err.is_type_error());
    }

    #[test]
    fn test_non_string_tag_is_type_error() {
        let map = MessageMap::new().with(TYPE_KEY, 7u32);
        assert!(Acknowledge::from_map(&map).unwrap_err().is_type_error());
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let map = MessageMap::tagged("move").with("base_angle", 1.0);
        assert_eq!(
            Move::from_map(&map).unwrap_err(),
            MessageError::MissingField("elev_angle")
        );

        // Integers are not floats for Move
        let map = MessageMap::tagged("move")
            .with("base_angle", 1i64)
            .with("elev_angle", 2.0);
        let err = Move::from_map(&map).unwrap_err();
        assert!(err.is_data_error());
        assert!(matches!(err, MessageError::InvalidField { field: "base_angle", .. }));

        let map = MessageMap::tagged("shoot").with("times", 2.0);
        assert!(Shoot::from_map(&map).unwrap_err().is_data_error());

        let map = MessageMap::tagged("shoot").with("times", true);
        assert!(Shoot::from_map(&map).unwrap_err().is_data_error());
    }

    #[test]
    fn test_status_decode_accepts_whole_number_angles() {
        let map = MessageMap::tagged("status")
            .with("base_angle", 90i64)
            .with("elevation_angle", 12.5)
            .with("shots", 4u32);
        let status = Status::from_map(&map).unwrap();
        assert_eq!(status, Status::new(90.0, 12.5, 4).unwrap());

        let map = MessageMap::tagged("status")
            .with("base_angle", i64::MAX)
            .with("elevation_angle", 0.0)
            .with("shots", 0u32);
        assert!(Status::from_map(&map).unwrap_err().is_data_error());
    }

    #[test]
    fn test_decoded_range_violation() {
        let map = MessageMap::tagged("address").with("port", 0u32);
        assert!(Address::from_map(&map).unwrap_err().is_validation_error());

        let map = MessageMap::tagged("shoot").with("times", u64::MAX);
        assert!(Shoot::from_map(&map).unwrap_err().is_validation_error());
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let map = MessageMap::tagged("address")
            .with("port", 80u32)
            .with("port", 8080u32);
        assert_eq!(Address::from_map(&map).unwrap().port(), 8080);
    }

    #[test]
    fn test_message_dispatch() {
        let shoot = Shoot::new(3).unwrap();
        let msg = Message::from_map(&shoot.to_map()).unwrap();
        assert_eq!(msg, Message::Shoot(shoot));
        assert_eq!(msg.tag(), "shoot");
        assert!(msg.expects_ack());

        let msg = Message::from(RequestStatus);
        assert_eq!(msg.tag(), "statusrequest");
        assert!(!msg.expects_ack());

        let err = Message::from_map(&MessageMap::tagged("launch")).unwrap_err();
        assert_eq!(err, MessageError::UnknownType("launch".to_string()));
    }
}
