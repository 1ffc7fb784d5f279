/// Opaque user identity as issued by the auth provider
pub type UserId = String;

/// Name of a source table in the primary store
pub type TableName = String;

/// Key of one subscriber set in the shared store: `{namespace}:{routing_key}`
pub fn set_key(namespace: &str, routing_key: &str) -> String {
    let mut key = String::with_capacity(namespace.len() + 1 + routing_key.len());
    key.push_str(namespace);
    key.push(':');
    key.push_str(routing_key);
    key
}
