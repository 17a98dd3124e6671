/// Runtime configuration for the provider, constructed by the hosting
/// process and injected into [`crate::engine::Provider`].
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Director container image
    pub image: String,

    /// Reconcile worker count
    pub workers: usize,

    /// Grace period applied to cascading workload deletion
    pub cleanup_grace_seconds: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            workers: 1,
            cleanup_grace_seconds: 30,
        }
    }
}

impl ProviderConfig {
    pub fn new<S: Into<String>>(image: S) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}
