//! Values crossing the call boundary: tagged parameters, typed return slots,
//! and the owned `Value` used for default arguments and host code.

use std::fmt;
use std::marker::PhantomData;

use super::abort::{Abort, AbortReason};
use super::opcodes::{REGT_FLOAT, REGT_INT, REGT_MULTIREG2, REGT_MULTIREG3, REGT_POINTER, REGT_STRING};

/// Owned scalar, independent of any frame.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i32),
    Float(f64),
    String(String),
    /// Host address; zero is null.
    Pointer(usize),
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Int(_) => REGT_INT,
            Value::Float(_) => REGT_FLOAT,
            Value::String(_) => REGT_STRING,
            Value::Pointer(_) => REGT_POINTER,
        }
    }

    /// Borrow as a parameter.
    pub fn as_param(&self) -> VmValue<'_> {
        match self {
            Value::Int(i) => VmValue::int(*i),
            Value::Float(f) => VmValue::float(*f),
            Value::String(s) => VmValue::string(s),
            Value::Pointer(p) => VmValue::pointer(*p as *mut u8),
        }
    }

    /// Parse a command-line style argument: int, then float, then string.
    pub fn parse_arg(text: &str) -> Value {
        if let Ok(i) = text.parse::<i32>() {
            Value::Int(i)
        } else if let Ok(f) = text.parse::<f64>() {
            Value::Float(f)
        } else {
            Value::String(text.to_string())
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Pointer(0) => write!(f, "null"),
            Value::Pointer(p) => write!(f, "{p:#x}"),
        }
    }
}

/// Tagged 16-byte parameter value. Strings are passed by reference to a
/// `String` that outlives the call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VmValue<'a> {
    bits: u64,
    tag: u8,
    _pad: [u8; 7],
    _marker: PhantomData<&'a String>,
}

const _: () = assert!(std::mem::size_of::<VmValue<'static>>() == 16);

pub(crate) const VALUE_SIZE: usize = std::mem::size_of::<VmValue<'static>>();
pub(crate) const VALUE_BITS_OFFSET: i32 = std::mem::offset_of!(VmValue<'static>, bits) as i32;
pub(crate) const VALUE_TAG_OFFSET: i32 = std::mem::offset_of!(VmValue<'static>, tag) as i32;

impl<'a> VmValue<'a> {
    pub const fn int(i: i32) -> Self {
        Self::from_raw(i as u32 as u64, REGT_INT)
    }

    pub const fn float(f: f64) -> Self {
        Self::from_raw(f.to_bits(), REGT_FLOAT)
    }

    pub fn string(s: &'a String) -> Self {
        Self::from_raw(s as *const String as usize as u64, REGT_STRING)
    }

    pub fn pointer(p: *mut u8) -> Self {
        Self::from_raw(p as usize as u64, REGT_POINTER)
    }

    pub const fn null() -> Self {
        Self::from_raw(0, REGT_POINTER)
    }

    pub(crate) const fn from_raw(bits: u64, tag: u8) -> Self {
        VmValue { bits, tag, _pad: [0; 7], _marker: PhantomData }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn as_int(&self) -> Option<i32> {
        (self.tag == REGT_INT).then_some(self.bits as u32 as i32)
    }

    pub fn as_float(&self) -> Option<f64> {
        (self.tag == REGT_FLOAT).then_some(f64::from_bits(self.bits))
    }

    pub fn as_pointer(&self) -> Option<*mut u8> {
        (self.tag == REGT_POINTER).then_some(self.bits as usize as *mut u8)
    }

    pub fn as_str(&self) -> Option<&'a str> {
        if self.tag != REGT_STRING || self.bits == 0 {
            return None;
        }
        // SAFETY: string values are only built from a `&'a String` or by the
        // VM from a live string register/constant that outlives the call.
        Some(unsafe { &*(self.bits as usize as *const String) }.as_str())
    }

    pub fn to_owned_value(&self) -> Value {
        match self.tag {
            REGT_FLOAT => Value::Float(f64::from_bits(self.bits)),
            REGT_STRING => Value::String(self.as_str().unwrap_or_default().to_string()),
            REGT_POINTER => Value::Pointer(self.bits as usize),
            _ => Value::Int(self.bits as u32 as i32),
        }
    }
}

impl fmt::Debug for VmValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmValue({:?})", self.to_owned_value())
    }
}

/// Typed destination for one return value.
#[repr(C)]
pub struct ReturnSlot<'a> {
    location: *mut u8,
    tag: u8,
    _marker: PhantomData<&'a mut u8>,
}

pub(crate) const SLOT_SIZE: usize = std::mem::size_of::<ReturnSlot<'static>>();
pub(crate) const SLOT_LOCATION_OFFSET: i32 = std::mem::offset_of!(ReturnSlot<'static>, location) as i32;
pub(crate) const SLOT_TAG_OFFSET: i32 = std::mem::offset_of!(ReturnSlot<'static>, tag) as i32;

impl<'a> ReturnSlot<'a> {
    pub fn int(dest: &'a mut i32) -> Self {
        Self::from_raw(dest as *mut i32 as *mut u8, REGT_INT)
    }

    pub fn float(dest: &'a mut f64) -> Self {
        Self::from_raw(dest as *mut f64 as *mut u8, REGT_FLOAT)
    }

    pub fn string(dest: &'a mut String) -> Self {
        Self::from_raw(dest as *mut String as *mut u8, REGT_STRING)
    }

    pub fn pointer(dest: &'a mut *mut u8) -> Self {
        Self::from_raw(dest as *mut *mut u8 as *mut u8, REGT_POINTER)
    }

    pub fn vector2(dest: &'a mut [f64; 2]) -> Self {
        Self::from_raw(dest.as_mut_ptr() as *mut u8, REGT_FLOAT | REGT_MULTIREG2)
    }

    pub fn vector3(dest: &'a mut [f64; 3]) -> Self {
        Self::from_raw(dest.as_mut_ptr() as *mut u8, REGT_FLOAT | REGT_MULTIREG3)
    }

    /// Slot over arbitrary storage. The VM builds these over caller registers.
    pub(crate) const fn from_raw(location: *mut u8, tag: u8) -> Self {
        ReturnSlot { location, tag, _marker: PhantomData }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    fn expect_tag(&self, tag: u8) -> Result<(), Abort> {
        if self.tag == tag {
            Ok(())
        } else {
            Err(Abort::with_message(
                AbortReason::Other,
                format!("return type mismatch: slot holds {}, value is {}", tag_name(self.tag), tag_name(tag)),
            ))
        }
    }

    pub fn set_int(&mut self, v: i32) -> Result<(), Abort> {
        self.expect_tag(REGT_INT)?;
        // SAFETY: tag checked; constructors tie the location to an i32.
        unsafe { *(self.location as *mut i32) = v };
        Ok(())
    }

    pub fn set_float(&mut self, v: f64) -> Result<(), Abort> {
        self.expect_tag(REGT_FLOAT)?;
        // SAFETY: tag checked.
        unsafe { *(self.location as *mut f64) = v };
        Ok(())
    }

    pub fn set_string(&mut self, v: &str) -> Result<(), Abort> {
        self.expect_tag(REGT_STRING)?;
        // SAFETY: tag checked; the destination is an initialized String.
        let dest = unsafe { &mut *(self.location as *mut String) };
        dest.clear();
        dest.push_str(v);
        Ok(())
    }

    pub fn set_pointer(&mut self, v: *mut u8) -> Result<(), Abort> {
        self.expect_tag(REGT_POINTER)?;
        // SAFETY: tag checked.
        unsafe { *(self.location as *mut *mut u8) = v };
        Ok(())
    }

    pub fn set_vector(&mut self, v: &[f64]) -> Result<(), Abort> {
        let tag = match v.len() {
            2 => REGT_FLOAT | REGT_MULTIREG2,
            3 => REGT_FLOAT | REGT_MULTIREG3,
            _ => REGT_FLOAT,
        };
        self.expect_tag(tag)?;
        let dest = self.location as *mut f64;
        for (i, x) in v.iter().enumerate() {
            // SAFETY: tag checked; vector slots cover `v.len()` doubles.
            unsafe { *dest.add(i) = *x };
        }
        Ok(())
    }

    /// Write an owned value, converting nothing.
    pub fn set_value(&mut self, v: &Value) -> Result<(), Abort> {
        match v {
            Value::Int(i) => self.set_int(*i),
            Value::Float(f) => self.set_float(*f),
            Value::String(s) => self.set_string(s),
            Value::Pointer(p) => self.set_pointer(*p as *mut u8),
        }
    }
}

pub fn tag_name(tag: u8) -> &'static str {
    match (tag & super::opcodes::REGT_TYPE, tag & super::opcodes::REGT_MULTIREG) {
        (REGT_FLOAT, REGT_MULTIREG2) => "vector2",
        (REGT_FLOAT, REGT_MULTIREG3) => "vector3",
        (REGT_INT, _) => "int",
        (REGT_FLOAT, _) => "float",
        (REGT_STRING, _) => "string",
        _ => "pointer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_carry_their_tag() {
        let s = String::from("hi");
        assert_eq!(VmValue::int(-3).as_int(), Some(-3));
        assert_eq!(VmValue::float(1.5).as_float(), Some(1.5));
        assert_eq!(VmValue::string(&s).as_str(), Some("hi"));
        assert_eq!(VmValue::int(1).as_float(), None);
        assert!(VmValue::null().as_pointer().is_some_and(|p| p.is_null()));
    }

    #[test]
    fn return_slot_rejects_wrong_type() {
        let mut out = 0i32;
        let mut slot = ReturnSlot::int(&mut out);
        let err = slot.set_float(2.0).unwrap_err();
        assert_eq!(err.reason, AbortReason::Other);
        slot.set_int(7).unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn vector_slot_takes_matching_width() {
        let mut v = [0.0; 3];
        let mut slot = ReturnSlot::vector3(&mut v);
        assert!(slot.set_vector(&[1.0, 2.0]).is_err());
        slot.set_vector(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(v, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn arguments_parse_int_then_float_then_string() {
        assert_eq!(Value::parse_arg("42"), Value::Int(42));
        assert_eq!(Value::parse_arg("2.5"), Value::Float(2.5));
        assert_eq!(Value::parse_arg("abc"), Value::String("abc".into()));
    }
}
