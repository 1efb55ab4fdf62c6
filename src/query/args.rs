use serde_json::Value;

/// Bind parameter for an optimized query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl QueryArg {
    /// Stable, unambiguous rendering used in cache fingerprints.
    ///
    /// Text is length-prefixed so `["a,b"]` and `["a", "b"]` never render the same.
    pub fn render(&self) -> String {
        match self {
            Self::Null => "n".to_string(),
            Self::Bool(value) => format!("b:{value}"),
            Self::Int(value) => format!("i:{value}"),
            Self::Float(value) => format!("f:{value:?}"),
            Self::Text(value) => format!("s{}:{value}", value.len()),
            Self::Json(value) => {
                let text = value.to_string();
                format!("j{}:{text}", text.len())
            }
        }
    }
}

/// Render an argument list for fingerprinting.
pub fn render_args(args: &[QueryArg]) -> String {
    let mut rendered = String::new();
    for (index, arg) in args.iter().enumerate() {
        if index > 0 {
            rendered.push(',');
        }
        rendered.push_str(&arg.render());
    }
    rendered
}

impl From<bool> for QueryArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for QueryArg {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for QueryArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for QueryArg {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for QueryArg {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for QueryArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for QueryArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Value> for QueryArg {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<QueryArg>> From<Option<T>> for QueryArg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
