//! Conversion of call arguments into the recorded argument map.
//!
//! Tuples are recorded positionally (`arg0`, `arg1`, ...). Keyword-style
//! arguments go through [`Named`], which records the fields of any serializable
//! struct or map under their own names.

use serde::Serialize;
use serde_json::Value;

use crate::types::ToolArguments;

pub trait ToolArgs {
    fn to_arguments(&self) -> ToolArguments;
}

/// Keyword arguments: the serialized fields become the argument names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Named<T>(pub T);

impl<T: Serialize> ToolArgs for Named<T> {
    fn to_arguments(&self) -> ToolArguments {
        match to_argument_value(&self.0) {
            Value::Object(fields) => fields,
            other => {
                let mut arguments = ToolArguments::new();
                arguments.insert(positional_name(0), other);
                arguments
            }
        }
    }
}

impl ToolArgs for ToolArguments {
    fn to_arguments(&self) -> ToolArguments {
        self.clone()
    }
}

impl ToolArgs for () {
    fn to_arguments(&self) -> ToolArguments {
        ToolArguments::new()
    }
}

macro_rules! impl_positional_args {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: Serialize),+> ToolArgs for ($($ty,)+) {
            fn to_arguments(&self) -> ToolArguments {
                let mut arguments = ToolArguments::new();
                $(arguments.insert(positional_name($idx), to_argument_value(&self.$idx));)+
                arguments
            }
        }
    };
}

impl_positional_args!(A: 0);
impl_positional_args!(A: 0, B: 1);
impl_positional_args!(A: 0, B: 1, C: 2);
impl_positional_args!(A: 0, B: 1, C: 2, D: 3);
impl_positional_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_positional_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

fn positional_name(index: usize) -> String {
    format!("arg{}", index)
}

/// Arguments that cannot be represented as JSON are recorded as `null`
/// rather than failing the call.
fn to_argument_value<T: Serialize + ?Sized>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(value) => value,
        Err(error) => {
            log::debug!("tool argument is not JSON-serializable: {}", error);
            Value::Null
        }
    }
}
