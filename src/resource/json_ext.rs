use serde_json::Value;

pub static API_VERSION_POINTER: &str = "/apiVersion";
pub static KIND_POINTER: &str = "/kind";
pub static NAMESPACE_POINTER: &str = "/metadata/namespace";
pub static NAME_POINTER: &str = "/metadata/name";
pub static RESOURCE_VERSION_POINTER: &str = "/metadata/resourceVersion";

/// Accessors for the fields that every api object has, regardless of its kind
pub trait ResourceJson {
    fn get_api_version(&self) -> Option<&str>;
    fn get_kind(&self) -> Option<&str>;
    fn get_namespace(&self) -> Option<&str>;
    fn get_name(&self) -> Option<&str>;
    fn get_resource_version(&self) -> Option<&str>;
}

fn str_value<'a, 'b>(value: &'a Value, pointer: &'b str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

impl ResourceJson for Value {
    fn get_api_version(&self) -> Option<&str> {
        str_value(self, API_VERSION_POINTER)
    }

    fn get_kind(&self) -> Option<&str> {
        str_value(self, KIND_POINTER)
    }

    fn get_namespace(&self) -> Option<&str> {
        str_value(self, NAMESPACE_POINTER).filter(|ns| !ns.is_empty())
    }

    fn get_name(&self) -> Option<&str> {
        str_value(self, NAME_POINTER)
    }

    fn get_resource_version(&self) -> Option<&str> {
        str_value(self, RESOURCE_VERSION_POINTER)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_namespace_is_treated_as_missing() {
        let value = json!({"metadata": {"name": "foo", "namespace": ""}});
        assert_eq!(Some("foo"), value.get_name());
        assert_eq!(None, value.get_namespace());
        assert_eq!(None, value.get_kind());
    }
}
