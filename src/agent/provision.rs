//! Durable application of a provision bundle.
//!
//! Write order: credentials, then the server configuration, then the version
//! file. A crash anywhere before the last step leaves the previous version on
//! disk, so the next heartbeat reprovisions again.

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, info};
use ztgate_proto::ProvisionResponse;

use crate::enforcement::PointKind;
use crate::pki::keys::write_atomic;
use crate::tunnel::config::{BundleLayout, ServerRenderOptions, render_server_config};
use crate::{Error, Result};

const PUBLIC_MODE: u32 = 0o644;
const SECRET_MODE: u32 = 0o600;

/// Writes bundles into the agent state directory.
#[derive(Debug, Clone)]
pub struct Provisioner {
    layout: BundleLayout,
    server_config: PathBuf,
    status_file: PathBuf,
    role: PointKind,
}

impl Provisioner {
    /// Provisioner writing into `layout`, rendering the daemon config to
    /// `layout.dir()/config_file`.
    #[must_use]
    pub fn new(layout: BundleLayout, config_file: &str, status_file: PathBuf, role: PointKind) -> Self {
        Self {
            server_config: layout.dir().join(config_file),
            layout,
            status_file,
            role,
        }
    }

    /// Bundle file layout.
    #[must_use]
    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Rendered daemon configuration path.
    #[must_use]
    pub fn server_config_path(&self) -> &std::path::Path {
        &self.server_config
    }

    /// Last durably applied version. A missing or blank file reads as `None`.
    ///
    /// # Errors
    ///
    /// Fails on read errors other than a missing file.
    pub fn read_version(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(self.layout.version_file()) {
            Ok(s) => {
                let v = s.trim();
                Ok((!v.is_empty()).then(|| v.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write every bundle file and the server configuration, then persist the
    /// bundle's version.
    ///
    /// # Errors
    ///
    /// Any write failure aborts before the version file is touched.
    pub fn apply(&self, bundle: &ProvisionResponse) -> Result<()> {
        if bundle.tls_auth_enabled && bundle.tls_auth_key.is_none() {
            return Err(Error::ControlPlane(
                "bundle enables tls-auth but carries no key".to_string(),
            ));
        }
        std::fs::create_dir_all(self.layout.dir())?;

        write_atomic(&self.layout.ca_cert(), bundle.ca_cert.as_bytes(), PUBLIC_MODE)?;
        write_atomic(&self.layout.server_cert(), bundle.server_cert.as_bytes(), PUBLIC_MODE)?;
        write_atomic(&self.layout.server_key(), bundle.server_key.as_bytes(), SECRET_MODE)?;
        if let Some(ref dh) = bundle.dh_params {
            write_atomic(&self.layout.dh_params(), dh.as_bytes(), PUBLIC_MODE)?;
        }
        if let Some(ref ta) = bundle.tls_auth_key {
            write_atomic(&self.layout.tls_auth_key(), ta.as_bytes(), SECRET_MODE)?;
        }

        let ccd = self.layout.ccd_dir();
        let rendered = render_server_config(
            bundle,
            &self.layout,
            &ServerRenderOptions {
                status_file: &self.status_file,
                client_config_dir: (self.role == PointKind::Hub).then_some(ccd.as_path()),
            },
        )?;
        write_atomic(&self.server_config, rendered.as_bytes(), PUBLIC_MODE)?;
        debug!(path = %self.server_config.display(), "Server configuration written");

        write_atomic(
            &self.layout.version_file(),
            format!("{}\n", bundle.config_version).as_bytes(),
            SECRET_MODE,
        )?;
        info!(version = %bundle.config_version, "Provision bundle applied");
        Ok(())
    }
}
