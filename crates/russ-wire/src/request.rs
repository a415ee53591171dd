use serde::Serialize;

use crate::Attributes;
use crate::PROTOCOL_STRING;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub protocol_string: String,
    pub service_path: String,
    pub operation: String,
    pub attributes: Attributes,
    pub arguments: Vec<String>,
}

impl Request {
    pub fn new(service_path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            protocol_string: PROTOCOL_STRING.to_string(),
            service_path: service_path.into(),
            operation: operation.into(),
            attributes: Attributes::new(),
            arguments: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_defaults() {
        let req = Request::new("/", "ping");
        assert_eq!(req.protocol_string, PROTOCOL_STRING);
        assert_eq!(req.service_path, "/");
        assert_eq!(req.operation, "ping");
        assert!(req.attributes.is_empty());
        assert!(req.arguments.is_empty());
    }

    #[test]
    fn test_builder() {
        let req = Request::new("/svc", "echo")
            .with_attributes(Attributes::from([("lang", "en")]))
            .with_arguments(["a", "b"]);
        assert_eq!(req.attributes.get("lang"), Some("en"));
        assert_eq!(req.arguments, vec!["a".to_string(), "b".to_string()]);
    }
}
