use http::HeaderName;

/// CredentialStore defines the port for resolving presented secrets to identities
pub trait CredentialStore: Send + Sync + 'static {
    /// Request header carrying the secret
    fn header_name(&self) -> &HeaderName;

    /// The header name as configured, for messages shown to callers
    fn header_label(&self) -> &str {
        self.header_name().as_str()
    }

    /// Resolve a secret to the stable identity it belongs to
    ///
    /// # Returns
    /// `None` when the secret is unknown
    fn lookup(&self, secret: &str) -> Option<String>;
}
