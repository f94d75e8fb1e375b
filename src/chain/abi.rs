//! Human-readable ABI signatures: parsing, log decoding and calldata decoding.
//!
//! Events are declared like `"Transfer(address indexed from, address indexed to, uint256 value)"`
//! and functions like `"transfer(address to, uint256 amount)"`. Named tuples such as
//! `"Swap((address currency0, address currency1) key, int128 amount)"` are supported and
//! decode into nested JSON objects.

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{keccak256, B256};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Failed to parse type '{0}': {1}")]
    TypeParse(String, String),
    #[error("Missing closing parenthesis in '{0}'")]
    MissingCloseParen(String),
    #[error("No event with topic0 {0}")]
    UnknownTopic(B256),
    #[error("No event named '{0}'")]
    UnknownEvent(String),
    #[error("No function with selector 0x{0}")]
    UnknownSelector(String),
    #[error("Log for {event} has {found} topics, expected {expected}")]
    MissingTopics {
        event: String,
        expected: usize,
        found: usize,
    },
    #[error("Calldata too short ({0} bytes)")]
    InputTooShort(usize),
    #[error("Failed to decode {name}: {reason}")]
    Decode { name: String, reason: String },
}

/// Field names of a (possibly nested) tuple parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldNames {
    Leaf,
    Tuple(Vec<(String, FieldNames)>),
    Array(Box<FieldNames>),
}

#[derive(Debug, Clone)]
pub struct AbiParam {
    pub name: String,
    pub ty: DynSolType,
    pub type_string: String,
    pub indexed: bool,
    pub fields: FieldNames,
}

impl AbiParam {
    fn is_static_topic(&self) -> bool {
        matches!(
            self.ty,
            DynSolType::Address
                | DynSolType::Bool
                | DynSolType::Uint(_)
                | DynSolType::Int(_)
                | DynSolType::FixedBytes(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub name: String,
    pub canonical_signature: String,
    pub topic0: B256,
    pub params: Vec<AbiParam>,
}

/// A decoded log: event name plus its parameters as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub name: String,
    pub params: Value,
}

impl ParsedEvent {
    pub fn from_signature(signature: &str) -> Result<Self, AbiError> {
        let (name, params) = parse_signature(signature)?;
        let canonical_signature = canonical(&name, &params);
        let topic0 = keccak256(canonical_signature.as_bytes());

        Ok(ParsedEvent {
            name,
            canonical_signature,
            topic0,
            params,
        })
    }

    pub fn indexed_params(&self) -> impl Iterator<Item = &AbiParam> {
        self.params.iter().filter(|p| p.indexed)
    }

    pub fn data_params(&self) -> impl Iterator<Item = &AbiParam> {
        self.params.iter().filter(|p| !p.indexed)
    }

    /// Decode topics (including topic0) and data into a JSON object keyed by
    /// parameter name, in declaration order.
    pub fn decode(&self, topics: &[B256], data: &[u8]) -> Result<Value, AbiError> {
        let expected = 1 + self.indexed_params().count();
        if topics.len() < expected {
            return Err(AbiError::MissingTopics {
                event: self.name.clone(),
                expected,
                found: topics.len(),
            });
        }

        let mut indexed_values = Vec::new();
        for (param, topic) in self.indexed_params().zip(topics.iter().skip(1)) {
            let value = if param.is_static_topic() {
                let decoded = param
                    .ty
                    .abi_decode(topic.as_slice())
                    .map_err(|e| self.decode_error(e))?;
                value_to_json(&decoded, &param.fields)
            } else {
                // Dynamic indexed values are only available as their hash.
                Value::String(topic.to_string())
            };
            indexed_values.push(value);
        }

        let data_types: Vec<DynSolType> = self.data_params().map(|p| p.ty.clone()).collect();
        let data_values = if data_types.is_empty() {
            Vec::new()
        } else {
            match DynSolType::Tuple(data_types)
                .abi_decode_params(data)
                .map_err(|e| self.decode_error(e))?
            {
                DynSolValue::Tuple(values) => values,
                other => vec![other],
            }
        };

        let mut indexed_iter = indexed_values.into_iter();
        let mut data_iter = self.data_params().zip(data_values.iter());
        let mut out = Map::new();
        for (i, param) in self.params.iter().enumerate() {
            let value = if param.indexed {
                indexed_iter.next()
            } else {
                data_iter
                    .next()
                    .map(|(p, v)| value_to_json(v, &p.fields))
            };
            let value = value.ok_or_else(|| AbiError::Decode {
                name: self.name.clone(),
                reason: "parameter count mismatch".to_string(),
            })?;
            out.insert(param_key(&param.name, i), value);
        }

        Ok(Value::Object(out))
    }

    fn decode_error(&self, e: impl std::fmt::Display) -> AbiError {
        AbiError::Decode {
            name: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFunction {
    pub name: String,
    pub canonical_signature: String,
    pub selector: [u8; 4],
    pub inputs: Vec<AbiParam>,
}

impl ParsedFunction {
    /// `multicall(bytes[])`: named `multicall` in any case, with a single
    /// `bytes[]` parameter.
    pub fn is_multicall(&self) -> bool {
        self.name.eq_ignore_ascii_case("multicall")
            && matches!(
                self.inputs.as_slice(),
                [param] if param.ty == DynSolType::Array(Box::new(DynSolType::Bytes))
            )
    }

    pub fn from_signature(signature: &str) -> Result<Self, AbiError> {
        let (name, inputs) = parse_signature(signature)?;
        let canonical_signature = canonical(&name, &inputs);
        let hash = keccak256(canonical_signature.as_bytes());
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&hash[..4]);

        Ok(ParsedFunction {
            name,
            canonical_signature,
            selector,
            inputs,
        })
    }

    /// Decode calldata arguments (selector excluded).
    pub fn decode_args(&self, args: &[u8]) -> Result<Vec<DynSolValue>, AbiError> {
        if self.inputs.is_empty() {
            return Ok(Vec::new());
        }
        let types = self.inputs.iter().map(|p| p.ty.clone()).collect();
        match DynSolType::Tuple(types).abi_decode_params(args) {
            Ok(DynSolValue::Tuple(values)) => Ok(values),
            Ok(other) => Ok(vec![other]),
            Err(e) => Err(AbiError::Decode {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// The parsed events and functions of one contract.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    events: Vec<ParsedEvent>,
    functions: Vec<ParsedFunction>,
}

impl ContractAbi {
    pub fn from_signatures(events: &[String], functions: &[String]) -> Result<Self, AbiError> {
        Ok(ContractAbi {
            events: events
                .iter()
                .map(|s| ParsedEvent::from_signature(s))
                .collect::<Result<_, _>>()?,
            functions: functions
                .iter()
                .map(|s| ParsedFunction::from_signature(s))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = &ParsedEvent> {
        self.events.iter()
    }

    pub fn functions(&self) -> impl Iterator<Item = &ParsedFunction> {
        self.functions.iter()
    }

    pub fn event(&self, name: &str) -> Option<&ParsedEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn event_by_topic0(&self, topic0: &B256) -> Option<&ParsedEvent> {
        self.events.iter().find(|e| &e.topic0 == topic0)
    }

    pub fn function_by_selector(&self, selector: &[u8]) -> Option<&ParsedFunction> {
        self.functions.iter().find(|f| f.selector[..] == *selector)
    }

    /// topic0 values for the named events, or for every declared event when
    /// `names` is empty.
    pub fn topics_for(&self, names: &[String]) -> Result<Vec<B256>, AbiError> {
        if names.is_empty() {
            return Ok(self.events.iter().map(|e| e.topic0).collect());
        }
        names
            .iter()
            .map(|name| {
                self.event(name)
                    .map(|e| e.topic0)
                    .ok_or_else(|| AbiError::UnknownEvent(name.clone()))
            })
            .collect()
    }

    pub fn decode_log(&self, topics: &[B256], data: &[u8]) -> Result<DecodedEvent, AbiError> {
        let topic0 = topics
            .first()
            .ok_or_else(|| AbiError::InvalidSignature("log has no topics".to_string()))?;
        let event = self
            .event_by_topic0(topic0)
            .ok_or(AbiError::UnknownTopic(*topic0))?;
        Ok(DecodedEvent {
            name: event.name.clone(),
            params: event.decode(topics, data)?,
        })
    }

    pub fn decode_call(&self, input: &[u8]) -> Result<(&ParsedFunction, Vec<DynSolValue>), AbiError> {
        if input.len() < 4 {
            return Err(AbiError::InputTooShort(input.len()));
        }
        let function = self
            .function_by_selector(&input[..4])
            .ok_or_else(|| AbiError::UnknownSelector(hex::encode(&input[..4])))?;
        let args = function.decode_args(&input[4..])?;
        Ok((function, args))
    }

    /// Name of the function a transaction invokes.
    ///
    /// When the outer call is a multicall that is not itself a target, nested
    /// `bytes[]` payloads are searched depth-first and the first inner call
    /// whose name is in `targets` wins. Otherwise the outer name is returned.
    pub fn resolve_function_name(&self, input: &[u8], targets: &[String]) -> Result<String, AbiError> {
        let (function, args) = self.decode_call(input)?;
        if targets.is_empty() || targets.iter().any(|t| t == &function.name) {
            return Ok(function.name.clone());
        }
        Ok(self
            .search_multicall(function, &args, targets)
            .unwrap_or_else(|| function.name.clone()))
    }

    fn search_multicall(
        &self,
        function: &ParsedFunction,
        args: &[DynSolValue],
        targets: &[String],
    ) -> Option<String> {
        if !function.is_multicall() {
            return None;
        }
        let [DynSolValue::Array(items)] = args else {
            return None;
        };
        for item in items {
            let DynSolValue::Bytes(inner) = item else {
                continue;
            };
            match self.decode_call(inner) {
                Ok((inner_fn, inner_args)) => {
                    if targets.iter().any(|t| t == &inner_fn.name) {
                        return Some(inner_fn.name.clone());
                    }
                    if let Some(found) = self.search_multicall(inner_fn, &inner_args, targets) {
                        return Some(found);
                    }
                }
                Err(e) => {
                    tracing::debug!("Skipping undecodable multicall payload: {}", e);
                }
            }
        }
        None
    }
}

fn param_key(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("param_{}", index)
    } else {
        name.to_string()
    }
}

fn canonical(name: &str, params: &[AbiParam]) -> String {
    let types: Vec<&str> = params.iter().map(|p| p.type_string.as_str()).collect();
    format!("{}({})", name, types.join(","))
}

fn parse_signature(signature: &str) -> Result<(String, Vec<AbiParam>), AbiError> {
    let signature = signature.trim();
    let signature = signature
        .strip_prefix("event ")
        .or_else(|| signature.strip_prefix("function "))
        .unwrap_or(signature)
        .trim();

    let open_paren = signature
        .find('(')
        .ok_or_else(|| AbiError::InvalidSignature(signature.to_string()))?;
    let name = signature[..open_paren].trim().to_string();
    if name.is_empty() {
        return Err(AbiError::InvalidSignature(format!("empty name in '{}'", signature)));
    }

    let close_paren = find_matching_close_paren(signature, open_paren)
        .ok_or_else(|| AbiError::MissingCloseParen(signature.to_string()))?;

    let params = split_top_level(&signature[open_paren + 1..close_paren])
        .into_iter()
        .map(parse_param)
        .collect::<Result<Vec<_>, _>>()?;

    Ok((name, params))
}

fn find_matching_close_paren(s: &str, open_pos: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, c) in s[open_pos..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open_pos + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are not nested inside parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Parse `"address indexed from"`, `"uint256"`, `"bytes calldata data"` or a
/// tuple such as `"(address a, uint256 b)[] orders"`.
fn parse_param(param: &str) -> Result<AbiParam, AbiError> {
    let (type_string, fields, rest) = if param.starts_with('(') {
        let close = find_matching_close_paren(param, 0)
            .ok_or_else(|| AbiError::MissingCloseParen(param.to_string()))?;
        let inner = split_top_level(&param[1..close])
            .into_iter()
            .map(parse_param)
            .collect::<Result<Vec<_>, _>>()?;

        let after = &param[close + 1..];
        let suffix_len = after
            .find(|c: char| !(c == '[' || c == ']' || c.is_ascii_digit()))
            .unwrap_or(after.len());
        let suffix = &after[..suffix_len];

        let types: Vec<&str> = inner.iter().map(|p| p.type_string.as_str()).collect();
        let type_string = format!("({}){}", types.join(","), suffix);

        let mut fields = FieldNames::Tuple(
            inner
                .iter()
                .enumerate()
                .map(|(i, p)| (param_key(&p.name, i), p.fields.clone()))
                .collect(),
        );
        for _ in 0..suffix.matches('[').count() {
            fields = FieldNames::Array(Box::new(fields));
        }
        (type_string, fields, &after[suffix_len..])
    } else {
        let mut split = param.splitn(2, char::is_whitespace);
        let ty = split.next().unwrap_or_default().to_string();
        (ty, FieldNames::Leaf, split.next().unwrap_or_default())
    };

    let mut indexed = false;
    let mut name = String::new();
    for word in rest.split_whitespace() {
        match word {
            "indexed" => indexed = true,
            "calldata" | "memory" | "storage" | "payable" => {}
            other if name.is_empty() => name = other.to_string(),
            other => {
                return Err(AbiError::InvalidSignature(format!(
                    "unexpected '{}' in parameter '{}'",
                    other, param
                )))
            }
        }
    }

    let ty = DynSolType::parse(&type_string)
        .map_err(|e| AbiError::TypeParse(type_string.clone(), e.to_string()))?;

    Ok(AbiParam {
        name,
        ty,
        type_string,
        indexed,
        fields,
    })
}

/// Convert a decoded value into JSON. Integers are rendered as decimal strings
/// so 256-bit values survive the round trip through JSONB.
pub fn value_to_json(value: &DynSolValue, fields: &FieldNames) -> Value {
    match value {
        DynSolValue::Address(addr) => Value::String(addr.to_checksum(None)),
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(v, _) => Value::String(v.to_string()),
        DynSolValue::Int(v, _) => Value::String(v.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            let inner = match fields {
                FieldNames::Array(inner) => inner.as_ref(),
                _ => &FieldNames::Leaf,
            };
            Value::Array(items.iter().map(|v| value_to_json(v, inner)).collect())
        }
        DynSolValue::Tuple(items) => match fields {
            FieldNames::Tuple(names) if names.len() == items.len() => Value::Object(
                names
                    .iter()
                    .zip(items)
                    .map(|((name, sub), v)| (name.clone(), value_to_json(v, sub)))
                    .collect(),
            ),
            _ => Value::Array(
                items
                    .iter()
                    .map(|v| value_to_json(v, &FieldNames::Leaf))
                    .collect(),
            ),
        },
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{:?}", other)),
    }
}
