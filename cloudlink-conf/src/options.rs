/// Startup options that take precedence over file and environment configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, loaded after the default locations.
    pub cfg_name: Option<String>,
    /// Overrides `endpoint.pid`.
    pub endpoint_pid: Option<String>,
}
