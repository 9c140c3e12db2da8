//! PKCS#11 attribute templates.
//!
//! Templates are built as owned Rust values and only lowered to
//! `CK_ATTRIBUTE` arrays at the FFI boundary.

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_ULONG, CK_VOID_PTR,
};

/// Represents a PKCS#11 attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
    String(String),
}

impl AttributeValue {
    /// Encoding as the module expects to read it.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AttributeValue::Bool(flag) => vec![CK_BBOOL::from(*flag)],
            AttributeValue::Ulong(value) => value.to_ne_bytes().to_vec(),
            AttributeValue::Bytes(bytes) => bytes.clone(),
            AttributeValue::String(text) => text.as_bytes().to_vec(),
        }
    }
}

/// Ordered attribute list used for object creation and key generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    attributes: Vec<(CK_ATTRIBUTE_TYPE, AttributeValue)>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute, replacing an earlier value of the same type.
    pub fn set(&mut self, attr_type: CK_ATTRIBUTE_TYPE, value: AttributeValue) {
        match self.attributes.iter_mut().find(|(t, _)| *t == attr_type) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((attr_type, value)),
        }
    }

    pub fn with_bool(mut self, attr_type: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        self.set(attr_type, AttributeValue::Bool(value));
        self
    }

    pub fn with_ulong(mut self, attr_type: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        self.set(attr_type, AttributeValue::Ulong(value));
        self
    }

    pub fn with_bytes(mut self, attr_type: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        self.set(attr_type, AttributeValue::Bytes(value.into()));
        self
    }

    pub fn with_string(mut self, attr_type: CK_ATTRIBUTE_TYPE, value: impl Into<String>) -> Self {
        self.set(attr_type, AttributeValue::String(value.into()));
        self
    }

    /// Set every listed attribute to `CK_TRUE`.
    pub fn with_flags(mut self, attr_types: &[CK_ATTRIBUTE_TYPE]) -> Self {
        for attr_type in attr_types {
            self.set(*attr_type, AttributeValue::Bool(true));
        }
        self
    }

    pub fn get(&self, attr_type: CK_ATTRIBUTE_TYPE) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, value)| value)
    }

    /// Boolean attribute value, `None` when absent or not a boolean.
    pub fn flag(&self, attr_type: CK_ATTRIBUTE_TYPE) -> Option<bool> {
        match self.get(attr_type) {
            Some(AttributeValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn ulong(&self, attr_type: CK_ATTRIBUTE_TYPE) -> Option<CK_ULONG> {
        match self.get(attr_type) {
            Some(AttributeValue::Ulong(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn bytes(&self, attr_type: CK_ATTRIBUTE_TYPE) -> Option<&[u8]> {
        match self.get(attr_type) {
            Some(AttributeValue::Bytes(value)) => Some(value.as_slice()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(CK_ATTRIBUTE_TYPE, AttributeValue)> {
        self.attributes.iter()
    }

    pub fn to_raw(&self) -> RawTemplate {
        let values: Vec<Vec<u8>> = self.attributes.iter().map(|(_, v)| v.encode()).collect();
        let attributes = self
            .attributes
            .iter()
            .zip(values.iter())
            .map(|((attr_type, _), value)| CK_ATTRIBUTE {
                type_: *attr_type,
                pValue: value.as_ptr() as CK_VOID_PTR,
                ulValueLen: value.len() as CK_ULONG,
            })
            .collect();
        RawTemplate {
            _values: values,
            attributes,
        }
    }
}

/// `CK_ATTRIBUTE` array together with the buffers it points into.
///
/// The value buffers are heap allocations owned here, so moving the
/// `RawTemplate` does not invalidate the pointers.
pub struct RawTemplate {
    _values: Vec<Vec<u8>>,
    attributes: Vec<CK_ATTRIBUTE>,
}

impl RawTemplate {
    pub fn as_mut_ptr(&mut self) -> *mut CK_ATTRIBUTE {
        self.attributes.as_mut_ptr()
    }

    pub fn count(&self) -> CK_ULONG {
        self.attributes.len() as CK_ULONG
    }

    pub fn attributes(&self) -> &[CK_ATTRIBUTE] {
        &self.attributes
    }
}
