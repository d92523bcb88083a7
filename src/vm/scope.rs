//! Execution sides and the run-time scope barrier, plus the class
//! descriptors host objects point at.

use std::fmt;
use std::sync::Arc;

use super::abort::Abort;
use super::function::{Function, FunctionFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Side {
    #[default]
    PlainData = 0,
    Ui = 1,
    Play = 2,
    /// Resolved from the receiver's class at call time.
    Virtual = 3,
    Clear = 4,
}

impl Side {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Side::PlainData,
            1 => Side::Ui,
            2 => Side::Play,
            3 => Side::Virtual,
            4 => Side::Clear,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::PlainData => "data",
            Side::Ui => "ui",
            Side::Play => "play",
            Side::Virtual => "virtual",
            Side::Clear => "clearscope",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Side::PlainData, Side::Ui, Side::Play, Side::Virtual, Side::Clear]
            .into_iter()
            .find(|side| side.name() == s)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run-time class information reachable from any host object.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub name: String,
    pub side: Side,
    pub vtable: Vec<Arc<Function>>,
}

/// Every object handed to script code starts with this header.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    pub class: *const ClassDescriptor,
}

/// Side a call to `callee` runs on when the receiver has class `class`.
pub fn effective_side(callee: &Function, class: Option<&ClassDescriptor>) -> Side {
    if callee.flags.contains(FunctionFlags::VIRTUAL_SCOPE) || callee.side == Side::Virtual {
        class.map_or(Side::PlainData, |c| c.side)
    } else {
        callee.side
    }
}

/// ui and play code may not call into each other; data and clearscope
/// functions are callable from anywhere.
pub fn check_call(caller: Side, callee_side: Side, callee_name: &str) -> Result<(), Abort> {
    let allowed = match callee_side {
        Side::PlainData | Side::Clear | Side::Virtual => true,
        Side::Ui => caller != Side::Play,
        Side::Play => caller != Side::Ui,
    };
    if allowed {
        Ok(())
    } else {
        Err(Abort::other(format!(
            "Can't call {callee_side} function {callee_name} from {caller} context"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::function::Proto;

    #[test]
    fn ui_and_play_are_exclusive() {
        assert!(check_call(Side::Play, Side::Ui, "f").is_err());
        assert!(check_call(Side::Ui, Side::Play, "f").is_err());
        assert!(check_call(Side::Ui, Side::Ui, "f").is_ok());
        assert!(check_call(Side::Play, Side::Clear, "f").is_ok());
        assert!(check_call(Side::Ui, Side::PlainData, "f").is_ok());
    }

    #[test]
    fn barrier_message_names_both_sides() {
        let err = check_call(Side::Play, Side::Ui, "Menu.Open").unwrap_err();
        assert_eq!(err.to_string(), "Can't call ui function Menu.Open from play context");
    }

    #[test]
    fn virtual_scope_takes_class_side() {
        let f = Function::script("f", FunctionFlags::METHOD | FunctionFlags::VIRTUAL_SCOPE, Proto::default());
        let class = ClassDescriptor { name: "Hud".into(), side: Side::Ui, vtable: vec![] };
        assert_eq!(effective_side(&f, Some(&class)), Side::Ui);
        let g = Function::script("g", FunctionFlags::METHOD, Proto::default()).with_side(Side::Play);
        assert_eq!(effective_side(&g, Some(&class)), Side::Play);
    }

    #[test]
    fn sides_parse_by_name() {
        assert_eq!(Side::parse("play"), Some(Side::Play));
        assert_eq!(Side::parse("clearscope"), Some(Side::Clear));
        assert_eq!(Side::parse("nope"), None);
    }
}
