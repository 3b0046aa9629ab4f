//! Just enough pickle support to be able to read PyTorch checkpoints.
//!
//! The decoder is a small stack machine over the opcodes `torch.save` emits (protocols 2 to
//! 5). Objects are allocated in an arena and the stack and memo table hold arena indices, so
//! a list or mapping memoized before it was filled is seen filled through every reference.
//! Globals resolve through the closed table in [`super::registry`]; nothing is imported or
//! executed. When STOP is reached the arena is resolved into an owned [`DecodedValue`].
//!
//! Tensors come out as [`DecodedValue::TensorRef`]: their storages live outside the stream
//! and are resolved by [`super::materialize`].

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use std::io::{self, Cursor};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use hashbrown::HashMap;

use super::opcode::{HIGHEST_PROTOCOL, OpCode};
use super::registry::{self, Global};
use crate::error::{Error, Result};
use crate::tensor::DType;
use crate::value::{DecodedValue, Dict, GlobalRef, StorageRef, TensorDescriptor};

type NodeId = usize;

/// Upper bound on the values produced when resolving the arena. Aliasing lets a short stream
/// describe an exponentially large tree.
const MAX_RESOLVED_VALUES: usize = 1 << 24;
const MAX_DEPTH: usize = 512;

#[derive(Debug)]
enum Node {
    Value(DecodedValue),
    Tuple(Vec<NodeId>),
    List(Vec<NodeId>),
    Dict {
        items: Vec<(NodeId, NodeId)>,
        attributes: Vec<(String, NodeId)>,
    },
    Global(Global, GlobalRef),
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::Value(value) => value.kind(),
            Node::Tuple(_) => "tuple",
            Node::List(_) => "list",
            Node::Dict { .. } => "dict",
            Node::Global(..) => "global",
        }
    }
}

/// Decode a pickle stream into its root value.
pub fn decode(data: &[u8]) -> Result<DecodedValue> {
    Machine::new(data).run()
}

struct Machine<'a> {
    input: Cursor<&'a [u8]>,
    nodes: Vec<Node>,
    stack: Vec<NodeId>,
    marks: Vec<usize>,
    memo: HashMap<u32, NodeId>,
    /// Offset of the opcode being executed.
    offset: u64,
    protocol: u8,
}

impl<'a> Machine<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            input: Cursor::new(data),
            nodes: Vec::new(),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            offset: 0,
            protocol: 0,
        }
    }

    fn run(mut self) -> Result<DecodedValue> {
        loop {
            self.offset = self.input.position();
            let byte = self.read_u8()?;
            let op = OpCode::try_from(byte).map_err(|opcode| Error::UnsupportedOpcode {
                opcode,
                offset: self.offset,
            })?;
            if op == OpCode::Stop {
                break;
            }
            self.step(op)?;
        }

        let root = self.pop()?;
        log::debug!(
            "Decoded pickle stream: protocol {}, {} objects, {} memo entries",
            self.protocol,
            self.nodes.len(),
            self.memo.len()
        );

        let mut resolver = Resolver {
            nodes: &self.nodes,
            visiting: alloc::vec![false; self.nodes.len()],
            budget: MAX_RESOLVED_VALUES,
            offset: self.offset,
        };
        resolver.resolve(root, 0)
    }

    fn step(&mut self, op: OpCode) -> Result<()> {
        match op {
            OpCode::Proto => {
                let protocol = self.read_u8()?;
                if protocol > HIGHEST_PROTOCOL {
                    return Err(self.invalid(format!("unsupported protocol {protocol}")));
                }
                self.protocol = protocol;
            }
            // Frames only group opcodes for buffered readers; the input is already in memory.
            OpCode::Frame => {
                self.read_u64()?;
            }
            OpCode::Stop => {}

            OpCode::Mark => self.marks.push(self.stack.len()),
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::PopMark => {
                self.pop_mark()?;
            }
            OpCode::Dup => {
                let id = self.top()?;
                self.stack.push(id);
            }

            OpCode::EmptyDict => self.push_node(Node::Dict {
                items: Vec::new(),
                attributes: Vec::new(),
            }),
            OpCode::EmptyList | OpCode::EmptySet => self.push_node(Node::List(Vec::new())),
            OpCode::EmptyTuple => self.push_node(Node::Tuple(Vec::new())),
            OpCode::Dict => {
                let items = self.pop_mark()?;
                let items = self.pairs(items)?;
                self.push_node(Node::Dict {
                    items,
                    attributes: Vec::new(),
                });
            }
            OpCode::List | OpCode::FrozenSet => {
                let items = self.pop_mark()?;
                self.push_node(Node::List(items));
            }
            OpCode::Tuple => {
                let items = self.pop_mark()?;
                self.push_node(Node::Tuple(items));
            }
            OpCode::Tuple1 | OpCode::Tuple2 | OpCode::Tuple3 => {
                let len = match op {
                    OpCode::Tuple1 => 1,
                    OpCode::Tuple2 => 2,
                    _ => 3,
                };
                let items = self.pop_n(len)?;
                self.push_node(Node::Tuple(items));
            }
            OpCode::Append => {
                let item = self.pop()?;
                let list = self.top()?;
                self.list_mut(list)?.push(item);
            }
            OpCode::Appends | OpCode::AddItems => {
                let items = self.pop_mark()?;
                let list = self.top()?;
                self.list_mut(list)?.extend(items);
            }
            OpCode::SetItem => {
                let value = self.pop()?;
                let key = self.pop()?;
                let dict = self.top()?;
                self.dict_items_mut(dict)?.push((key, value));
            }
            OpCode::SetItems => {
                let items = self.pop_mark()?;
                let items = self.pairs(items)?;
                let dict = self.top()?;
                self.dict_items_mut(dict)?.extend(items);
            }

            OpCode::Int => {
                let line = self.read_line()?;
                let value = match line {
                    b"00" => DecodedValue::Bool(false),
                    b"01" => DecodedValue::Bool(true),
                    _ => DecodedValue::Int(self.parse_text(line, "INT")?),
                };
                self.push_value(value);
            }
            OpCode::BinInt => {
                let value = self.read_i32()?;
                self.push_value(DecodedValue::Int(value as i64));
            }
            OpCode::BinInt1 => {
                let value = self.read_u8()?;
                self.push_value(DecodedValue::Int(value as i64));
            }
            OpCode::BinInt2 => {
                let value = self.input.read_u16::<LittleEndian>().map_err(|e| self.eof(e))?;
                self.push_value(DecodedValue::Int(value as i64));
            }
            OpCode::Long1 => {
                let len = self.read_u8()? as u64;
                let bytes = self.read_bytes(len)?;
                let value = self.decode_long(bytes)?;
                self.push_value(DecodedValue::Int(value));
            }
            OpCode::Long4 => {
                let len = self.read_length_i32()?;
                let bytes = self.read_bytes(len)?;
                let value = self.decode_long(bytes)?;
                self.push_value(DecodedValue::Int(value));
            }
            OpCode::BinFloat => {
                // BINFLOAT is the one big-endian argument in the format.
                let value = self.input.read_f64::<BigEndian>().map_err(|e| self.eof(e))?;
                self.push_value(DecodedValue::Float(value));
            }
            OpCode::Float => {
                let line = self.read_line()?;
                let value = self.parse_text(line, "FLOAT")?;
                self.push_value(DecodedValue::Float(value));
            }
            OpCode::None => self.push_value(DecodedValue::None),
            OpCode::NewTrue => self.push_value(DecodedValue::Bool(true)),
            OpCode::NewFalse => self.push_value(DecodedValue::Bool(false)),

            OpCode::BinUnicode | OpCode::ShortBinUnicode | OpCode::BinUnicode8 => {
                let len = match op {
                    OpCode::ShortBinUnicode => self.read_u8()? as u64,
                    OpCode::BinUnicode => self.read_u32()? as u64,
                    _ => self.read_u64()?,
                };
                let bytes = self.read_bytes(len)?;
                let text = self.utf8(bytes)?;
                self.push_value(DecodedValue::String(text));
            }
            OpCode::BinString | OpCode::ShortBinString => {
                let len = match op {
                    OpCode::ShortBinString => self.read_u8()? as u64,
                    _ => self.read_length_i32()?,
                };
                let bytes = self.read_bytes(len)?;
                // Python 2 `str`: text when it is valid UTF-8, raw bytes otherwise.
                let value = match core::str::from_utf8(bytes) {
                    Ok(text) => DecodedValue::String(text.to_string()),
                    Err(_) => DecodedValue::Bytes(bytes.to_vec()),
                };
                self.push_value(value);
            }
            OpCode::BinBytes
            | OpCode::ShortBinBytes
            | OpCode::BinBytes8
            | OpCode::ByteArray8 => {
                let len = match op {
                    OpCode::ShortBinBytes => self.read_u8()? as u64,
                    OpCode::BinBytes => self.read_u32()? as u64,
                    _ => self.read_u64()?,
                };
                let bytes = self.read_bytes(len)?;
                self.push_value(DecodedValue::Bytes(bytes.to_vec()));
            }

            OpCode::Global => {
                let module = self.read_line()?;
                let module = self.utf8(module)?;
                let name = self.read_line()?;
                let name = self.utf8(name)?;
                self.push_global(module, name)?;
            }
            OpCode::StackGlobal => {
                let name = self.pop()?;
                let module = self.pop()?;
                let name = self.string(name, "global name")?;
                let module = self.string(module, "global module")?;
                self.push_global(module, name)?;
            }
            OpCode::Reduce | OpCode::NewObj => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let result = self.call(callable, args)?;
                self.stack.push(result);
            }
            OpCode::Build => {
                let state = self.pop()?;
                let target = self.top()?;
                self.build(target, state)?;
            }
            OpCode::BinPersId => {
                let pid = self.pop()?;
                let storage = self.persistent_id(pid)?;
                self.push_value(DecodedValue::PersistentId(storage));
            }

            OpCode::Put => {
                let line = self.read_line()?;
                let index = self.parse_text(line, "PUT")?;
                self.memo_put(index)?;
            }
            OpCode::BinPut => {
                let index = self.read_u8()? as u32;
                self.memo_put(index)?;
            }
            OpCode::LongBinPut => {
                let index = self.read_u32()?;
                self.memo_put(index)?;
            }
            OpCode::Memoize => {
                let index = self.memo.len() as u32;
                self.memo_put(index)?;
            }
            OpCode::Get => {
                let line = self.read_line()?;
                let index = self.parse_text(line, "GET")?;
                self.memo_get(index)?;
            }
            OpCode::BinGet => {
                let index = self.read_u8()? as u32;
                self.memo_get(index)?;
            }
            OpCode::LongBinGet => {
                let index = self.read_u32()?;
                self.memo_get(index)?;
            }
        }
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::invalid(self.offset, message)
    }

    // Input

    fn eof(&self, error: io::Error) -> Error {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => Error::TruncatedStream {
                offset: self.input.position(),
            },
            _ => Error::Io(error),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.input.read_u8().map_err(|e| self.eof(e))
    }

    fn read_i32(&mut self) -> Result<i32> {
        self.input.read_i32::<LittleEndian>().map_err(|e| self.eof(e))
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.input.read_u32::<LittleEndian>().map_err(|e| self.eof(e))
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.input.read_u64::<LittleEndian>().map_err(|e| self.eof(e))
    }

    fn read_length_i32(&mut self) -> Result<u64> {
        let len = self.read_i32()?;
        u64::try_from(len).map_err(|_| self.invalid(format!("negative length {len}")))
    }

    /// Borrow the next `len` bytes of the input.
    fn read_bytes(&mut self, len: u64) -> Result<&'a [u8]> {
        let data: &'a [u8] = *self.input.get_ref();
        let start = self.input.position();
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data.len() as u64)
            .ok_or(Error::TruncatedStream { offset: start })?;
        self.input.set_position(end);
        Ok(&data[start as usize..end as usize])
    }

    /// Read a newline-terminated argument, without the terminator.
    fn read_line(&mut self) -> Result<&'a [u8]> {
        let data: &'a [u8] = *self.input.get_ref();
        let start = self.input.position() as usize;
        let rest = data.get(start..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(Error::TruncatedStream {
                offset: data.len() as u64,
            })?;
        self.input.set_position((start + len + 1) as u64);
        let line = &rest[..len];
        Ok(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| self.invalid(format!("invalid UTF-8: {e}")))
    }

    fn parse_text<T: core::str::FromStr>(&self, line: &[u8], opcode: &str) -> Result<T> {
        let text = self.utf8(line)?;
        text.trim_end_matches('L')
            .parse()
            .map_err(|_| self.invalid(format!("invalid {opcode} argument '{text}'")))
    }

    /// Little-endian two's complement integer of arbitrary width, as written by LONG1/LONG4.
    fn decode_long(&self, bytes: &[u8]) -> Result<i64> {
        let Some(last) = bytes.last() else {
            return Ok(0);
        };
        let negative = last & 0x80 != 0;
        let fill = if negative { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        let value = i64::from_le_bytes(buf);

        if bytes.len() > 8 && (bytes[8..].iter().any(|b| *b != fill) || (value < 0) != negative)
        {
            return Err(self.invalid("integer does not fit in 64 bits"));
        }
        Ok(value)
    }

    // Stack

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn push_node(&mut self, node: Node) {
        let id = self.alloc(node);
        self.stack.push(id);
    }

    fn push_value(&mut self, value: DecodedValue) {
        self.push_node(Node::Value(value));
    }

    fn push_global(&mut self, module: String, name: String) -> Result<()> {
        let global = registry::resolve(&module, &name).ok_or_else(|| Error::UnsupportedGlobal {
            name: format!("{module}.{name}"),
            offset: self.offset,
        })?;
        self.push_node(Node::Global(global, GlobalRef::new(module, name)));
        Ok(())
    }

    /// Lowest stack position the current mark frame may pop.
    fn floor(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    fn pop(&mut self) -> Result<NodeId> {
        if self.stack.len() <= self.floor() {
            return Err(self.invalid("stack underflow"));
        }
        self.stack
            .pop()
            .ok_or_else(|| Error::invalid(self.offset, "stack underflow"))
    }

    fn top(&self) -> Result<NodeId> {
        match self.stack.last() {
            Some(id) if self.stack.len() > self.floor() => Ok(*id),
            _ => Err(self.invalid("stack underflow")),
        }
    }

    fn pop_n(&mut self, len: usize) -> Result<Vec<NodeId>> {
        if self.stack.len() < self.floor() + len {
            return Err(self.invalid("stack underflow"));
        }
        let at = self.stack.len() - len;
        Ok(self.stack.split_off(at))
    }

    fn pop_mark(&mut self) -> Result<Vec<NodeId>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| self.invalid("no MARK on the stack"))?;
        Ok(self.stack.split_off(mark))
    }

    fn pairs(&self, items: Vec<NodeId>) -> Result<Vec<(NodeId, NodeId)>> {
        if items.len() % 2 != 0 {
            return Err(self.invalid("odd number of items for a mapping"));
        }
        Ok(items.chunks_exact(2).map(|kv| (kv[0], kv[1])).collect())
    }

    fn list_mut(&mut self, id: NodeId) -> Result<&mut Vec<NodeId>> {
        let offset = self.offset;
        match &mut self.nodes[id] {
            Node::List(items) => Ok(items),
            other => Err(Error::invalid(
                offset,
                format!("cannot append to a {}", other.kind()),
            )),
        }
    }

    fn dict_items_mut(&mut self, id: NodeId) -> Result<&mut Vec<(NodeId, NodeId)>> {
        let offset = self.offset;
        match &mut self.nodes[id] {
            Node::Dict { items, .. } => Ok(items),
            other => Err(Error::invalid(
                offset,
                format!("cannot set an item on a {}", other.kind()),
            )),
        }
    }

    fn memo_put(&mut self, index: u32) -> Result<()> {
        let id = self.top()?;
        self.memo.insert(index, id);
        Ok(())
    }

    fn memo_get(&mut self, index: u32) -> Result<()> {
        let id = *self.memo.get(&index).ok_or(Error::MemoNotFound {
            index,
            offset: self.offset,
        })?;
        self.stack.push(id);
        Ok(())
    }

    // Typed views of nodes

    fn value(&self, id: NodeId) -> Option<&DecodedValue> {
        match &self.nodes[id] {
            Node::Value(value) => Some(value),
            _ => None,
        }
    }

    fn int(&self, id: NodeId, what: &str) -> Result<i64> {
        self.value(id)
            .and_then(DecodedValue::as_i64)
            .ok_or_else(|| self.unexpected(id, what, "an int"))
    }

    fn index(&self, id: NodeId, what: &str) -> Result<usize> {
        let value = self.int(id, what)?;
        usize::try_from(value).map_err(|_| self.invalid(format!("negative {what} {value}")))
    }

    fn bool(&self, id: NodeId, what: &str) -> Result<bool> {
        match self.value(id) {
            Some(DecodedValue::Bool(b)) => Ok(*b),
            Some(DecodedValue::Int(i)) => Ok(*i != 0),
            _ => Err(self.unexpected(id, what, "a bool")),
        }
    }

    fn string(&self, id: NodeId, what: &str) -> Result<String> {
        self.value(id)
            .and_then(DecodedValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| self.unexpected(id, what, "a string"))
    }

    fn items(&self, id: NodeId, what: &str) -> Result<&[NodeId]> {
        match &self.nodes[id] {
            Node::Tuple(items) | Node::List(items) => Ok(items),
            _ => Err(self.unexpected(id, what, "a sequence")),
        }
    }

    fn ints(&self, id: NodeId, what: &str) -> Result<Vec<i64>> {
        self.items(id, what)?
            .iter()
            .map(|item| self.int(*item, what))
            .collect()
    }

    fn unexpected(&self, id: NodeId, what: &str, expected: &str) -> Error {
        self.invalid(format!(
            "{what} must be {expected}, found {}",
            self.nodes[id].kind()
        ))
    }

    // Objects

    /// Call a registered global with a tuple of arguments and return the new object.
    fn call(&mut self, callable: NodeId, args: NodeId) -> Result<NodeId> {
        let global = match &self.nodes[callable] {
            Node::Global(global, _) if global.is_callable() => *global,
            Node::Global(_, name) => {
                return Err(self.invalid(format!("{name} cannot be called")));
            }
            other => return Err(self.invalid(format!("cannot call a {}", other.kind()))),
        };
        let args = self.items(args, "call arguments")?.to_vec();

        let node = match global {
            Global::OrderedDict => {
                let mut items = Vec::new();
                if let Some(pairs) = args.first() {
                    for pair in self.items(*pairs, "OrderedDict items")? {
                        match self.items(*pair, "OrderedDict item")? {
                            [key, value] => items.push((*key, *value)),
                            _ => return Err(self.invalid("OrderedDict items must be pairs")),
                        }
                    }
                }
                Node::Dict {
                    items,
                    attributes: Vec::new(),
                }
            }
            Global::CodecsEncode => {
                let [text, encoding] = args.as_slice() else {
                    return Err(self.invalid("_codecs.encode takes (text, encoding)"));
                };
                let text = self.string(*text, "encoded text")?;
                let encoding = self.string(*encoding, "encoding")?;
                Node::Value(DecodedValue::Bytes(self.encode(&text, &encoding)?))
            }
            Global::Set | Global::FrozenSet => match args.first() {
                Some(iterable) => Node::List(self.items(*iterable, "set items")?.to_vec()),
                None => Node::List(Vec::new()),
            },
            Global::RebuildTensor => Node::Value(DecodedValue::TensorRef(
                self.rebuild_tensor(&args, None)?,
            )),
            Global::RebuildTensorV2 => Node::Value(DecodedValue::TensorRef(
                self.rebuild_tensor(&args, Some(4))?,
            )),
            Global::RebuildParameter => {
                let [data, requires_grad, ..] = args.as_slice() else {
                    return Err(
                        self.invalid("_rebuild_parameter takes (data, requires_grad, hooks)")
                    );
                };
                let (data, requires_grad) = (*data, self.bool(*requires_grad, "requires_grad")?);
                match self.value(data) {
                    Some(DecodedValue::TensorRef(descriptor)) => {
                        let mut descriptor = descriptor.clone();
                        descriptor.requires_grad = requires_grad;
                        Node::Value(DecodedValue::TensorRef(descriptor))
                    }
                    _ => return Err(self.unexpected(data, "parameter data", "a tensor")),
                }
            }
            Global::RebuildFromTypeV2 => {
                let [func, new_type, inner_args, state] = args.as_slice() else {
                    return Err(self.invalid(
                        "_rebuild_from_type_v2 takes (func, new_type, args, state)",
                    ));
                };
                if !matches!(self.nodes[*new_type], Node::Global(Global::TensorType, _)) {
                    return Err(self.unexpected(*new_type, "tensor type", "a tensor class"));
                }
                if !self.is_empty_state(*state) {
                    log::trace!("Dropping tensor subclass state at offset {}", self.offset);
                }
                return self.call(*func, *inner_args);
            }
            Global::Storage(_) | Global::TensorType => {
                return Err(self.invalid("storage and tensor classes cannot be called"));
            }
        };
        Ok(self.alloc(node))
    }

    fn encode(&self, text: &str, encoding: &str) -> Result<Vec<u8>> {
        match encoding {
            "latin1" | "latin-1" | "iso-8859-1" => text
                .chars()
                .map(|c| u8::try_from(c as u32))
                .collect::<core::result::Result<Vec<_>, _>>()
                .map_err(|_| self.invalid("text is not latin-1")),
            "utf-8" | "utf8" => Ok(text.as_bytes().to_vec()),
            other => Err(self.invalid(format!("unsupported encoding '{other}'"))),
        }
    }

    fn is_empty_state(&self, id: NodeId) -> bool {
        match &self.nodes[id] {
            Node::Value(DecodedValue::None) => true,
            Node::Dict { items, attributes } => items.is_empty() && attributes.is_empty(),
            _ => false,
        }
    }

    /// `(storage, storage_offset, size, stride[, requires_grad, ...])`
    fn rebuild_tensor(
        &self,
        args: &[NodeId],
        requires_grad_at: Option<usize>,
    ) -> Result<TensorDescriptor> {
        if args.len() < 4 {
            return Err(self.invalid(format!(
                "tensor rebuild expects at least 4 arguments, got {}",
                args.len()
            )));
        }
        let storage = match self.value(args[0]) {
            Some(DecodedValue::PersistentId(storage)) => storage.clone(),
            _ => return Err(self.unexpected(args[0], "tensor storage", "a persistent id")),
        };
        let storage_offset = self.index(args[1], "storage offset")?;
        let shape = self
            .ints(args[2], "tensor size")?
            .into_iter()
            .map(|dim| {
                usize::try_from(dim)
                    .map_err(|_| self.invalid(format!("negative dimension {dim}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let stride = self.ints(args[3], "tensor stride")?;
        let requires_grad = match requires_grad_at.and_then(|at| args.get(at)) {
            Some(id) => self.bool(*id, "requires_grad")?,
            None => false,
        };

        let dtype = storage.dtype;
        Ok(TensorDescriptor::new(
            storage,
            dtype,
            shape,
            stride,
            storage_offset,
            requires_grad,
        ))
    }

    /// `('storage', storage_type, key, location, numel)`
    fn persistent_id(&self, pid: NodeId) -> Result<StorageRef> {
        let items = self.items(pid, "persistent id")?;
        let [tag, storage_type, key, location, numel] = items else {
            return Err(self.invalid(format!(
                "persistent id must have 5 fields, found {}",
                items.len()
            )));
        };
        let tag = self.string(*tag, "persistent id tag")?;
        if tag != "storage" {
            return Err(self.invalid(format!("unsupported persistent id '{tag}'")));
        }

        let dtype = match &self.nodes[*storage_type] {
            Node::Global(Global::Storage(dtype), _) => *dtype,
            Node::Value(DecodedValue::String(name)) => DType::from_storage_name(name)
                .ok_or_else(|| self.invalid(format!("unknown storage type '{name}'")))?,
            other => {
                return Err(self.invalid(format!(
                    "storage type must be a storage class, found {}",
                    other.kind()
                )));
            }
        };
        let key = match self.value(*key) {
            Some(DecodedValue::Int(key)) => key.to_string(),
            _ => self.string(*key, "storage key")?,
        };
        let location = self.string(*location, "storage location")?;
        let num_elements = self.index(*numel, "storage size")?;

        Ok(StorageRef::new(key, dtype, location, num_elements))
    }

    /// Apply BUILD state. Mappings receive it as attributes; other objects have no state to
    /// keep.
    fn build(&mut self, target: NodeId, state: NodeId) -> Result<()> {
        if !matches!(self.nodes[target], Node::Dict { .. }) {
            log::trace!(
                "Dropping BUILD state of a {} at offset {}",
                self.nodes[target].kind(),
                self.offset
            );
            return Ok(());
        }

        // State is a dict, or a (dict, slots) pair, either half possibly None.
        let parts = match &self.nodes[state] {
            Node::Tuple(parts) if parts.len() == 2 => parts.clone(),
            _ => alloc::vec![state],
        };
        let mut attributes = Vec::new();
        for part in parts {
            match &self.nodes[part] {
                Node::Value(DecodedValue::None) => {}
                Node::Dict { items, .. } => {
                    for (name, value) in items {
                        attributes.push((self.string(*name, "attribute name")?, *value));
                    }
                }
                other => {
                    return Err(self.invalid(format!(
                        "BUILD state must be a dict, found {}",
                        other.kind()
                    )));
                }
            }
        }

        if let Node::Dict {
            attributes: existing,
            ..
        } = &mut self.nodes[target]
        {
            existing.extend(attributes);
        }
        Ok(())
    }
}

/// Turns the arena into an owned tree.
struct Resolver<'n> {
    nodes: &'n [Node],
    visiting: Vec<bool>,
    budget: usize,
    offset: u64,
}

impl Resolver<'_> {
    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::invalid(self.offset, message)
    }

    fn resolve(&mut self, id: NodeId, depth: usize) -> Result<DecodedValue> {
        if self.visiting[id] {
            return Err(self.invalid("object graph contains a cycle"));
        }
        if depth > MAX_DEPTH {
            return Err(self.invalid("object graph is nested too deeply"));
        }
        self.budget = self
            .budget
            .checked_sub(1)
            .ok_or_else(|| self.invalid("object graph is too large"))?;

        self.visiting[id] = true;
        let nodes = self.nodes;
        let value = match &nodes[id] {
            Node::Value(value) => value.clone(),
            Node::Tuple(items) => DecodedValue::Tuple(self.resolve_all(items, depth)?),
            Node::List(items) => DecodedValue::List(self.resolve_all(items, depth)?),
            Node::Dict { items, attributes } => {
                let mut dict = Dict::new();
                for (key, value) in items {
                    let key = self.resolve(*key, depth + 1)?;
                    let value = self.resolve(*value, depth + 1)?;
                    dict.try_insert(key, value)
                        .map_err(|e| self.invalid(e.to_string()))?;
                }
                for (name, value) in attributes {
                    let value = self.resolve(*value, depth + 1)?;
                    dict.set_attribute(name.clone(), value);
                }
                DecodedValue::Dict(dict)
            }
            Node::Global(_, name) => DecodedValue::Global(name.clone()),
        };
        self.visiting[id] = false;
        Ok(value)
    }

    fn resolve_all(&mut self, items: &[NodeId], depth: usize) -> Result<Vec<DecodedValue>> {
        items
            .iter()
            .map(|item| self.resolve(*item, depth + 1))
            .collect()
    }
}
