// serializer.rs — tagged key/value tree for savegames
//
// One Serializer is either writing (append-only key/value emission into
// nested objects and arrays) or reading (a parsed JSON document walked with a
// container stack). Scalars equal to their supplied default are elided when
// writing inside an object; absent keys leave the destination unchanged when
// reading. Type mismatches are recoverable: they are logged, counted, and
// surface as an error from close().

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::warn;
use serde_json::{Map, Value};

use crate::compression::{CompressedBuffer, UnpackError};
use crate::names::{NameId, NameTable};

#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("{0} errors parsing savegame")]
    Errors(usize),
    #[error("invalid savegame document: {0}")]
    Document(#[from] serde_json::Error),
    #[error("corrupt compressed buffer: {0}")]
    Unpack(#[from] UnpackError),
}

// ============================================================
// String escaping
// ============================================================

/// Escape a byte string into JSON-safe text. Bytes >= 128 expand to the
/// two-byte UTF-8 encoding of the same code point; pure ASCII input passes
/// through unchanged. Reversible for any byte sequence, which keeps legacy
/// code-page content intact across a save/load cycle.
pub fn encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of `encode_bytes`. Code points above 255 cannot originate from
/// the writer and decode to `?`.
pub fn decode_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 255 { c as u32 as u8 } else { b'?' })
        .collect()
}

pub fn decode_string(text: &str) -> String {
    match String::from_utf8(decode_bytes(text)) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

// ============================================================
// Managed objects
// ============================================================

/// An object that participates in graph serialization. References between
/// such objects are written as indices into a per-writer table; the reader
/// materializes the table in two passes so back-references resolve.
pub trait SerialObject: std::any::Any {
    fn class_name(&self) -> &'static str;
    fn serialize_fields(&mut self, arc: &mut Serializer);
    fn serialize_user_vars(&mut self, _arc: &mut Serializer) {}
    /// Whether the object got linked into its owning subsystem during
    /// deserialization. Unlinked objects are torn down when the reader
    /// closes.
    fn is_linked(&self) -> bool {
        true
    }
    /// Teardown hook for objects discarded by the close sweep.
    fn unlink(&mut self) {}
}

pub type ObjectRef = Rc<RefCell<dyn SerialObject>>;

struct ClassDef {
    ctor: fn() -> ObjectRef,
    num_states: u32,
}

/// Maps class tags to constructors (for the two-pass object read) and state
/// counts (for state-reference validation).
#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassDef>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, num_states: u32, ctor: fn() -> ObjectRef) {
        self.classes
            .insert(name.to_string(), ClassDef { ctor, num_states });
    }

    pub fn create(&self, name: &str) -> Option<ObjectRef> {
        self.classes.get(name).map(|def| (def.ctor)())
    }

    pub fn num_states(&self, name: &str) -> Option<u32> {
        self.classes.get(name).map(|def| def.num_states)
    }
}

/// A reference to one state of a registered class, serialized as
/// `[class_name, state_index]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRef {
    pub class_name: String,
    pub index: u32,
}

// ============================================================
// Texture ids
// ============================================================

/// Index into a `TextureTable`. 0 is the explicit null texture, negative is
/// invalid/missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureId(pub i32);

impl TextureId {
    pub const NULL: TextureId = TextureId(0);
    pub const INVALID: TextureId = TextureId(-1);

    pub fn exists(self) -> bool {
        self.0 >= 0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Name/use-type table texture ids resolve against.
#[derive(Debug)]
pub struct TextureTable {
    entries: Vec<(String, i32)>,
    lookup: HashMap<(String, i32), i32>,
}

impl Default for TextureTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureTable {
    pub fn new() -> Self {
        let mut table = TextureTable {
            entries: Vec::new(),
            lookup: HashMap::new(),
        };
        // Entry 0 is the null texture.
        table.entries.push(("-".to_string(), 0));
        table.lookup.insert(("-".to_string(), 0), 0);
        table
    }

    pub fn add(&mut self, name: &str, use_type: i32) -> TextureId {
        if let Some(&id) = self.lookup.get(&(name.to_string(), use_type)) {
            return TextureId(id);
        }
        let id = self.entries.len() as i32;
        self.entries.push((name.to_string(), use_type));
        self.lookup.insert((name.to_string(), use_type), id);
        TextureId(id)
    }

    pub fn find(&self, name: &str, use_type: i32) -> Option<TextureId> {
        self.lookup
            .get(&(name.to_string(), use_type))
            .map(|&id| TextureId(id))
    }

    pub fn describe(&self, id: TextureId) -> Option<(&str, i32)> {
        if id.0 < 0 {
            return None;
        }
        self.entries
            .get(id.0 as usize)
            .map(|(name, ty)| (name.as_str(), *ty))
    }
}

// ============================================================
// Writer / reader internals
// ============================================================

enum WriteFrame {
    Object {
        map: Map<String, Value>,
        pending: Option<String>,
    },
    Array(Vec<Value>),
}

struct Writer {
    frames: Vec<WriteFrame>,
    pretty: bool,
    objects: Vec<ObjectRef>,
    object_map: HashMap<usize, usize>,
}

impl Writer {
    fn in_object(&self) -> bool {
        matches!(self.frames.last(), Some(WriteFrame::Object { .. }))
    }

    fn set_pending(&mut self, key: &str) {
        match self.frames.last_mut() {
            Some(WriteFrame::Object { pending, .. }) => *pending = Some(key.to_string()),
            _ => unreachable!("set_pending outside an object"),
        }
    }

    fn emit(&mut self, value: Value) {
        match self.frames.last_mut() {
            Some(WriteFrame::Object { map, pending }) => {
                let key = pending.take().expect("value emitted without a key");
                map.insert(key, value);
            }
            Some(WriteFrame::Array(items)) => items.push(value),
            None => unreachable!("no open container"),
        }
    }
}

fn write_key(w: &mut Writer, key: Option<&str>) {
    if w.in_object() {
        let key = key.expect("missing element name");
        w.set_pending(key);
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Seg {
    Key(String),
    Index(usize),
}

fn resolve<'a>(doc: &'a Value, path: &[Seg]) -> Option<&'a Value> {
    let mut node = doc;
    for seg in path {
        node = match seg {
            Seg::Key(k) => node.get(k.as_str())?,
            Seg::Index(i) => node.get(*i)?,
        };
    }
    Some(node)
}

struct ReadFrame {
    path: Vec<Seg>,
    next_index: usize,
    key_cursor: usize,
}

struct Reader {
    doc: Value,
    frames: Vec<ReadFrame>,
    objects: Vec<Option<ObjectRef>>,
    objects_read: bool,
    key_value: Option<Vec<Seg>>,
}

impl Reader {
    /// Locate the value for `key` in the current container. In objects a
    /// `None` key consumes the value cached by `get_key`; in arrays the key
    /// is ignored and the next element is consumed.
    fn find_key(&mut self, key: Option<&str>) -> Option<Vec<Seg>> {
        let frame_path = self.frames.last().expect("no open container").path.clone();
        match resolve(&self.doc, &frame_path) {
            Some(Value::Object(map)) => match key {
                None => self.key_value.take(),
                Some(k) => {
                    if map.contains_key(k) {
                        let mut path = frame_path;
                        path.push(Seg::Key(k.to_string()));
                        Some(path)
                    } else {
                        None
                    }
                }
            },
            Some(Value::Array(items)) => {
                let len = items.len();
                let frame = self.frames.last_mut().unwrap();
                if frame.next_index < len {
                    let mut path = frame_path;
                    path.push(Seg::Index(frame.next_index));
                    frame.next_index += 1;
                    Some(path)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

// ============================================================
// Scalars
// ============================================================

/// A scalar the serializer can emit and read back in a typed way. Narrower
/// integer widths are widened to 32 bits for storage and narrowed back
/// (truncating) on read.
pub trait Scalar: Sized + Clone + PartialEq {
    /// Type name used in mismatch diagnostics.
    const EXPECT: &'static str;
    fn to_value(&self) -> Value;
    fn from_value(v: &Value) -> Option<Self>;
}

impl Scalar for bool {
    const EXPECT: &'static str = "boolean";
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_bool()
    }
}

impl Scalar for i64 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_i64()
    }
}

impl Scalar for u64 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_u64()
    }
}

impl Scalar for i32 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_i64().and_then(|n| i32::try_from(n).ok())
    }
}

impl Scalar for u32 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_u64().and_then(|n| u32::try_from(n).ok())
    }
}

impl Scalar for i16 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self as i32)
    }
    fn from_value(v: &Value) -> Option<Self> {
        i32::from_value(v).map(|n| n as i16)
    }
}

impl Scalar for i8 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self as i32)
    }
    fn from_value(v: &Value) -> Option<Self> {
        i32::from_value(v).map(|n| n as i8)
    }
}

impl Scalar for u16 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self as u32)
    }
    fn from_value(v: &Value) -> Option<Self> {
        u32::from_value(v).map(|n| n as u16)
    }
}

impl Scalar for u8 {
    const EXPECT: &'static str = "integer";
    fn to_value(&self) -> Value {
        Value::from(*self as u32)
    }
    fn from_value(v: &Value) -> Option<Self> {
        u32::from_value(v).map(|n| n as u8)
    }
}

impl Scalar for f64 {
    const EXPECT: &'static str = "float";
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_f64()
    }
}

impl Scalar for f32 {
    const EXPECT: &'static str = "float";
    fn to_value(&self) -> Value {
        Value::from(*self as f64)
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_f64().map(|d| d as f32)
    }
}

impl Scalar for String {
    const EXPECT: &'static str = "string";
    fn to_value(&self) -> Value {
        Value::String(encode_bytes(self.as_bytes()))
    }
    fn from_value(v: &Value) -> Option<Self> {
        v.as_str().map(decode_string)
    }
}

// ============================================================
// Serializer
// ============================================================

pub struct Serializer {
    w: Option<Writer>,
    r: Option<Reader>,
    errors: usize,
}

impl Serializer {
    /// Open for writing. The root is one anonymous object.
    pub fn writer(pretty: bool) -> Serializer {
        Serializer {
            w: Some(Writer {
                frames: vec![WriteFrame::Object {
                    map: Map::new(),
                    pending: None,
                }],
                pretty,
                objects: Vec::new(),
                object_map: HashMap::new(),
            }),
            r: None,
            errors: 0,
        }
    }

    /// Open for reading from raw JSON text.
    pub fn reader(buffer: &[u8]) -> Result<Serializer, SerializerError> {
        let doc: Value = serde_json::from_slice(buffer)?;
        Ok(Serializer {
            w: None,
            r: Some(Reader {
                doc,
                frames: vec![ReadFrame {
                    path: Vec::new(),
                    next_index: 0,
                    key_cursor: 0,
                }],
                objects: Vec::new(),
                objects_read: false,
                key_value: None,
            }),
            errors: 0,
        })
    }

    /// Open for reading from a compressed envelope.
    pub fn reader_compressed(input: &CompressedBuffer) -> Result<Serializer, SerializerError> {
        let data = input.unpack()?;
        Serializer::reader(&data)
    }

    pub fn is_writing(&self) -> bool {
        self.w.is_some()
    }

    pub fn is_reading(&self) -> bool {
        self.r.is_some()
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    // ============================================================
    // Containers
    // ============================================================

    /// Returns false on read when the key is absent or not an object (the
    /// latter also counts as an error).
    pub fn begin_object(&mut self, key: Option<&str>) -> bool {
        if let Some(w) = self.w.as_mut() {
            write_key(w, key);
            w.frames.push(WriteFrame::Object {
                map: Map::new(),
                pending: None,
            });
            true
        } else if let Some(r) = self.r.as_mut() {
            match r.find_key(key) {
                Some(path) => {
                    if matches!(resolve(&r.doc, &path), Some(Value::Object(_))) {
                        r.frames.push(ReadFrame {
                            path,
                            next_index: 0,
                            key_cursor: 0,
                        });
                        true
                    } else {
                        warn!("object expected for '{}'", key.unwrap_or("?"));
                        self.errors += 1;
                        false
                    }
                }
                None => false,
            }
        } else {
            false
        }
    }

    pub fn end_object(&mut self) {
        if let Some(w) = self.w.as_mut() {
            if !w.in_object() {
                panic!("EndObject call not inside an object");
            }
            if w.frames.len() == 1 {
                panic!("EndObject would close the root; use output() to finish");
            }
            let Some(WriteFrame::Object { map, .. }) = w.frames.pop() else {
                unreachable!()
            };
            w.emit(Value::Object(map));
        } else if let Some(r) = self.r.as_mut() {
            if r.frames.len() <= 1 {
                panic!("EndObject call without a matching BeginObject");
            }
            r.frames.pop();
        }
    }

    pub fn begin_array(&mut self, key: Option<&str>) -> bool {
        if let Some(w) = self.w.as_mut() {
            write_key(w, key);
            w.frames.push(WriteFrame::Array(Vec::new()));
            true
        } else if let Some(r) = self.r.as_mut() {
            match r.find_key(key) {
                Some(path) => {
                    if matches!(resolve(&r.doc, &path), Some(Value::Array(_))) {
                        r.frames.push(ReadFrame {
                            path,
                            next_index: 0,
                            key_cursor: 0,
                        });
                        true
                    } else {
                        warn!("array expected for '{}'", key.unwrap_or("?"));
                        self.errors += 1;
                        false
                    }
                }
                None => false,
            }
        } else {
            false
        }
    }

    pub fn end_array(&mut self) {
        if let Some(w) = self.w.as_mut() {
            if w.in_object() {
                panic!("EndArray call not inside an array");
            }
            let Some(WriteFrame::Array(items)) = w.frames.pop() else {
                unreachable!()
            };
            w.emit(Value::Array(items));
        } else if let Some(r) = self.r.as_mut() {
            if r.frames.len() <= 1 {
                panic!("EndArray call without a matching BeginArray");
            }
            r.frames.pop();
        }
    }

    /// Element count of the current container when reading an array.
    pub fn array_size(&self) -> usize {
        let Some(r) = self.r.as_ref() else { return 0 };
        let path = &r.frames.last().expect("no open container").path;
        match resolve(&r.doc, path) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        }
    }

    /// Peeks at the length of the array stored under `group` in the current
    /// object, without entering it.
    pub fn get_size(&self, group: &str) -> usize {
        let Some(r) = self.r.as_ref() else { return 0 };
        let path = &r.frames.last().expect("no open container").path;
        match resolve(&r.doc, path) {
            Some(Value::Object(map)) => map
                .get(group)
                .and_then(|v| v.as_array())
                .map_or(0, |a| a.len()),
            _ => 0,
        }
    }

    /// Iterates the current object's keys. The returned key's value becomes
    /// the target of the next `None`-keyed access.
    pub fn get_key(&mut self) -> Option<String> {
        let r = self.r.as_mut()?;
        let path = r.frames.last().expect("no open container").path.clone();
        let cursor = r.frames.last().unwrap().key_cursor;
        let key = match resolve(&r.doc, &path) {
            Some(Value::Object(map)) => map.iter().nth(cursor).map(|(k, _)| k.clone())?,
            _ => return None,
        };
        r.frames.last_mut().unwrap().key_cursor += 1;
        let mut key_path = path;
        key_path.push(Seg::Key(key.clone()));
        r.key_value = Some(key_path);
        Some(key)
    }

    // ============================================================
    // Scalars
    // ============================================================

    /// Write or read a typed scalar. When writing inside an object a value
    /// equal to `def` is elided; when reading an absent key leaves `value`
    /// unchanged.
    pub fn value<T: Scalar>(&mut self, key: Option<&str>, value: &mut T, def: Option<&T>) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            if !w.in_object() || def.map_or(true, |d| d != value) {
                write_key(w, key);
                let v = value.to_value();
                w.emit(v);
            }
        } else if let Some(r) = self.r.as_mut() {
            if let Some(path) = r.find_key(key) {
                if let Some(node) = resolve(&r.doc, &path) {
                    match T::from_value(node) {
                        Some(v) => *value = v,
                        None => {
                            warn!("{} expected for '{}'", T::EXPECT, key.unwrap_or("?"));
                            self.errors += 1;
                        }
                    }
                }
            }
        }
        self
    }

    /// Nullable string. `None` writes as JSON null; anything that is not a
    /// string reads back as `None`.
    pub fn string_ptr(&mut self, key: Option<&str>, value: &mut Option<String>) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            write_key(w, key);
            match value {
                Some(s) => {
                    let enc = encode_bytes(s.as_bytes());
                    w.emit(Value::String(enc));
                }
                None => w.emit(Value::Null),
            }
        } else if let Some(r) = self.r.as_mut() {
            if let Some(path) = r.find_key(key) {
                match resolve(&r.doc, &path) {
                    Some(Value::String(s)) => *value = Some(decode_string(s)),
                    _ => *value = None,
                }
            }
        }
        self
    }

    /// Adds a string known to be valid UTF-8 without the byte escaping a
    /// serialized string gets.
    pub fn add_string(&mut self, key: Option<&str>, value: &str) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            write_key(w, key);
            w.emit(Value::String(value.to_string()));
        }
        self
    }

    /// Reads back a string without any unescaping.
    pub fn get_string(&mut self, key: Option<&str>) -> Option<String> {
        let r = self.r.as_mut()?;
        let path = r.find_key(key)?;
        match resolve(&r.doc, &path) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    // ============================================================
    // Special scalars
    // ============================================================

    /// A script number is an int when >= 0 and an interned name when
    /// negative (the stored string is the name for id `-num`).
    pub fn script_num(&mut self, key: Option<&str>, num: &mut i32, names: &mut NameTable) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            write_key(w, key);
            if *num < 0 {
                let name = names.get(NameId((-*num) as u32)).to_string();
                w.emit(Value::String(encode_bytes(name.as_bytes())));
            } else {
                w.emit(Value::from(*num));
            }
        } else if let Some(r) = self.r.as_mut() {
            if let Some(path) = r.find_key(key) {
                match resolve(&r.doc, &path) {
                    Some(Value::Number(n)) if n.as_i64().is_some() => {
                        *num = n.as_i64().unwrap() as i32;
                    }
                    Some(Value::String(s)) => {
                        *num = -(names.find_or_add(&decode_string(s)).0 as i32);
                    }
                    Some(_) => {
                        warn!("integer expected for '{}'", key.unwrap_or("?"));
                        self.errors += 1;
                    }
                    None => {}
                }
            }
        }
        self
    }

    /// Five-arg special block. When `arg0_is_name` holds and arg0 is
    /// negative it is stored as a name, same convention as `script_num`.
    pub fn args(
        &mut self,
        key: Option<&str>,
        args: &mut [i32; 5],
        defargs: Option<&[i32; 5]>,
        arg0_is_name: bool,
        names: &mut NameTable,
    ) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            if w.in_object() && defargs == Some(&*args) {
                return self;
            }
            write_key(w, key);
            let mut items = Vec::with_capacity(5);
            for (i, &arg) in args.iter().enumerate() {
                if i == 0 && arg < 0 && arg0_is_name {
                    let name = names.get(NameId((-arg) as u32)).to_string();
                    items.push(Value::String(encode_bytes(name.as_bytes())));
                } else {
                    items.push(Value::from(arg));
                }
            }
            w.emit(Value::Array(items));
        } else if let Some(r) = self.r.as_mut() {
            if let Some(path) = r.find_key(key) {
                match resolve(&r.doc, &path) {
                    Some(Value::Array(items)) => {
                        let items = items.clone();
                        let count = items.len().min(5);
                        for (i, item) in items.iter().take(count).enumerate() {
                            match item {
                                Value::Number(n) if n.as_i64().is_some() => {
                                    args[i] = n.as_i64().unwrap() as i32;
                                }
                                Value::String(s) if i == 0 => {
                                    args[0] = -(names.find_or_add(&decode_string(s)).0 as i32);
                                }
                                _ => {
                                    warn!(
                                        "integer expected for '{}[{}]'",
                                        key.unwrap_or("?"),
                                        i
                                    );
                                    self.errors += 1;
                                }
                            }
                        }
                    }
                    Some(_) => {
                        warn!("array expected for '{}'", key.unwrap_or("?"));
                        self.errors += 1;
                    }
                    None => {}
                }
            }
        }
        self
    }

    /// A texture id serializes as `[name, use_type]`, int 0 for the explicit
    /// null texture, or JSON null for a missing one.
    pub fn texture(
        &mut self,
        key: Option<&str>,
        value: &mut TextureId,
        def: Option<&TextureId>,
        table: &TextureTable,
    ) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            if w.in_object() && def == Some(value) {
                return self;
            }
            write_key(w, key);
            if !value.exists() {
                w.emit(Value::Null);
            } else if value.is_null() {
                w.emit(Value::from(0));
            } else {
                match table.describe(*value) {
                    Some((name, use_type)) => {
                        w.emit(Value::Array(vec![
                            Value::String(encode_bytes(name.as_bytes())),
                            Value::from(use_type),
                        ]));
                    }
                    None => w.emit(Value::Null),
                }
            }
        } else if let Some(r) = self.r.as_mut() {
            if let Some(path) = r.find_key(key) {
                match resolve(&r.doc, &path) {
                    Some(Value::Array(items)) => {
                        match (items.first().and_then(|v| v.as_str()), items.get(1).and_then(|v| v.as_i64())) {
                            (Some(name), Some(use_type)) => {
                                let name = decode_string(name);
                                *value = table
                                    .find(&name, use_type as i32)
                                    .unwrap_or(TextureId::INVALID);
                            }
                            _ => {
                                warn!(
                                    "value does not represent a texture for '{}'",
                                    key.unwrap_or("?")
                                );
                                *value = TextureId::NULL;
                                self.errors += 1;
                            }
                        }
                    }
                    Some(Value::Null) => *value = TextureId::INVALID,
                    Some(Value::Number(n)) if n.as_i64() == Some(0) => *value = TextureId::NULL,
                    Some(_) => {
                        warn!(
                            "value does not represent a texture for '{}'",
                            key.unwrap_or("?")
                        );
                        *value = TextureId::NULL;
                        self.errors += 1;
                    }
                    None => {}
                }
            }
        }
        self
    }

    /// A state reference serializes as `[owner_class_name, state_index]` or
    /// null. Unknown class or out-of-range index on read warns (not an
    /// error) and yields null.
    pub fn state_ref(
        &mut self,
        key: Option<&str>,
        value: &mut Option<StateRef>,
        classes: &ClassRegistry,
    ) -> &mut Self {
        if let Some(w) = self.w.as_mut() {
            write_key(w, key);
            match value {
                Some(state) => {
                    w.emit(Value::Array(vec![
                        Value::String(encode_bytes(state.class_name.as_bytes())),
                        Value::from(state.index),
                    ]));
                }
                None => w.emit(Value::Null),
            }
        } else if let Some(r) = self.r.as_mut() {
            if let Some(path) = r.find_key(key) {
                match resolve(&r.doc, &path) {
                    Some(Value::Null) => *value = None,
                    Some(Value::Array(items)) => {
                        match (items.first().and_then(|v| v.as_str()), items.get(1).and_then(|v| v.as_u64())) {
                            (Some(name), Some(index)) => {
                                let class_name = decode_string(name);
                                let index = index as u32;
                                match classes.num_states(&class_name) {
                                    Some(count) if index < count => {
                                        *value = Some(StateRef { class_name, index });
                                    }
                                    Some(_) => {
                                        warn!(
                                            "state index {} out of range for class '{}'",
                                            index, class_name
                                        );
                                        *value = None;
                                    }
                                    None => {
                                        warn!("unknown class '{}' in state reference", class_name);
                                        *value = None;
                                    }
                                }
                            }
                            _ => {
                                warn!("bad state reference for '{}'", key.unwrap_or("?"));
                                *value = None;
                                self.errors += 1;
                            }
                        }
                    }
                    Some(_) => {
                        warn!("bad state reference for '{}'", key.unwrap_or("?"));
                        *value = None;
                        self.errors += 1;
                    }
                    None => {}
                }
            }
        }
        self
    }

    // ============================================================
    // Object graph
    // ============================================================

    /// Serialize a reference to a managed object. The first time an object
    /// is seen while writing it gets an index in the writer's table;
    /// subsequent references reuse the index. Reading requires
    /// `read_objects` to have run.
    pub fn object(&mut self, key: Option<&str>, value: &mut Option<ObjectRef>) -> &mut Self {
        if self.w.is_some() {
            match value {
                Some(rc) => {
                    let index = self.object_index(rc);
                    let w = self.w.as_mut().unwrap();
                    write_key(w, key);
                    w.emit(Value::from(index as i64));
                }
                None => {
                    let w = self.w.as_mut().unwrap();
                    if !w.in_object() {
                        w.emit(Value::Null);
                    }
                }
            }
        } else if let Some(r) = self.r.as_mut() {
            if !r.objects_read {
                panic!("attempt to read an object reference before read_objects");
            }
            match r.find_key(key) {
                Some(path) => match resolve(&r.doc, &path) {
                    Some(Value::Null) => *value = None,
                    Some(Value::Number(n)) if n.as_i64().is_some() => {
                        let index = n.as_i64().unwrap();
                        if index >= 0 && (index as usize) < r.objects.len() {
                            *value = r.objects[index as usize].clone();
                        } else {
                            warn!("invalid object reference for '{}'", key.unwrap_or("?"));
                            *value = None;
                            self.errors += 1;
                        }
                    }
                    _ => *value = None,
                },
                None => *value = None,
            }
        }
        self
    }

    fn object_index(&mut self, rc: &ObjectRef) -> usize {
        let w = self.w.as_mut().unwrap();
        let ptr = Rc::as_ptr(rc) as *const () as usize;
        if let Some(&index) = w.object_map.get(&ptr) {
            index
        } else {
            let index = w.objects.len();
            w.objects.push(rc.clone());
            w.object_map.insert(ptr, index);
            index
        }
    }

    /// Emit every managed object seen by `object()` into an `"objects"`
    /// array at the current level, each prefixed with its class tag.
    pub fn write_objects(&mut self) {
        if self.w.is_none() || self.w.as_ref().unwrap().objects.is_empty() {
            return;
        }
        self.begin_array(Some("objects"));
        // Index loop: the table can grow while objects serialize references
        // to objects not seen before.
        let mut i = 0;
        while i < self.w.as_ref().unwrap().objects.len() {
            let obj = self.w.as_ref().unwrap().objects[i].clone();
            self.begin_object(None);
            self.add_string(Some("classtype"), obj.borrow().class_name());
            obj.borrow_mut().serialize_user_vars(self);
            obj.borrow_mut().serialize_fields(self);
            self.end_object();
            i += 1;
        }
        self.end_array();
    }

    /// Two-pass read of the `"objects"` array: instantiate every object by
    /// class tag, then deserialize fields so references resolve. Returns
    /// false when any class tag was unknown.
    pub fn read_objects(&mut self, classes: &ClassRegistry) -> bool {
        if self.r.is_none() {
            return true;
        }
        if !self.begin_array(Some("objects")) {
            return true;
        }
        let count = self.array_size();
        self.r.as_mut().unwrap().objects = vec![None; count];
        let mut found_errors = false;

        for i in 0..count {
            if self.begin_object(None) {
                let mut class_name = String::new();
                self.value(Some("classtype"), &mut class_name, None);
                match classes.create(&class_name) {
                    Some(obj) => self.r.as_mut().unwrap().objects[i] = Some(obj),
                    None => {
                        warn!("unknown object class '{}' in savegame", class_name);
                        found_errors = true;
                    }
                }
                self.end_object();
            }
        }
        self.r.as_mut().unwrap().objects_read = true;

        if !found_errors {
            // Rewind and fill fields now that every reference can resolve.
            let r = self.r.as_mut().unwrap();
            r.frames.last_mut().unwrap().next_index = 0;
            for i in 0..count {
                let obj = self.r.as_ref().unwrap().objects[i].clone();
                if self.begin_object(None) {
                    if let Some(obj) = obj {
                        obj.borrow_mut().serialize_user_vars(self);
                        obj.borrow_mut().serialize_fields(self);
                    }
                    self.end_object();
                }
            }
        } else {
            warn!("failed to restore all objects in savegame");
            self.errors += 1;
        }
        self.end_array();
        !found_errors
    }

    // ============================================================
    // Output / close
    // ============================================================

    /// Finalize the root object and return the document bytes. Writing only.
    pub fn output(&mut self) -> Option<Vec<u8>> {
        self.w.as_ref()?;
        self.write_objects();
        let w = self.w.take().unwrap();
        let pretty = w.pretty;
        let mut frames = w.frames;
        if frames.len() != 1 {
            panic!("unbalanced containers at end of write");
        }
        let Some(WriteFrame::Object { map, .. }) = frames.pop() else {
            unreachable!("root is always an object")
        };
        let root = Value::Object(map);
        let bytes = if pretty {
            serde_json::to_vec_pretty(&root).expect("JSON output cannot fail")
        } else {
            serde_json::to_vec(&root).expect("JSON output cannot fail")
        };
        Some(bytes)
    }

    /// Like `output`, wrapped in the deflate envelope.
    pub fn compressed_output(&mut self) -> Option<CompressedBuffer> {
        self.output().map(|bytes| CompressedBuffer::pack(&bytes))
    }

    /// Finish the session. On read, objects that were created but never
    /// linked into their owning subsystem are torn down; a nonzero error
    /// count aborts the load.
    pub fn close(&mut self) -> Result<(), SerializerError> {
        if self.w.is_none() && self.r.is_none() && self.errors == 0 {
            return Ok(());
        }
        self.w = None;
        if let Some(r) = self.r.take() {
            for obj in r.objects.iter().flatten() {
                if !obj.borrow().is_linked() {
                    obj.borrow_mut().unlink();
                }
            }
        }
        if self.errors > 0 {
            let count = self.errors;
            self.errors = 0;
            return Err(SerializerError::Errors(count));
        }
        Ok(())
    }
}

// ============================================================
// Tests
// ============================================================
