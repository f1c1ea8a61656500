//! Controller argument templates
//!
//! Arguments may reference `{{ webhook_port }}`, `{{ webhook_cert_dir }}` and
//! `{{ health_addr }}`. A pre-pass looks for `health_addr` across all
//! arguments and allocates one loopback address if any argument needs it;
//! rendering then substitutes the same address everywhere.

use std::collections::BTreeMap;
use std::path::Path;

use installer_process::ListenAddr;
use minijinja::{Environment, UndefinedBehavior};

use crate::envtest::LOCAL_HOST;
use crate::error::{Error, Result};

/// Placeholder for the webhook serving port
pub const WEBHOOK_PORT_VAR: &str = "webhook_port";
/// Placeholder for the webhook certificate directory
pub const WEBHOOK_CERT_DIR_VAR: &str = "webhook_cert_dir";
/// Placeholder for a freshly allocated health probe `host:port`
pub const HEALTH_ADDR_VAR: &str = "health_addr";

/// Rendered arguments and the health address they reference, if any
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedArgs {
    /// Arguments ready to pass to the binary
    pub args: Vec<String>,
    /// Health probe address allocated for `{{ health_addr }}`
    pub health_addr: Option<ListenAddr>,
}

/// Render `args` against the webhook serving details
pub fn render_args(args: &[String], webhook_port: u16, webhook_cert_dir: &Path) -> Result<RenderedArgs> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let template_err = |arg: &str, e: minijinja::Error| Error::Template {
        arg: arg.to_string(),
        message: e.to_string(),
    };

    let mut needs_health = false;
    for arg in args {
        let template = env.template_from_str(arg).map_err(|e| template_err(arg, e))?;
        needs_health |= template.undeclared_variables(false).contains(HEALTH_ADDR_VAR);
    }
    let health_addr = if needs_health {
        Some(ListenAddr::suggest(LOCAL_HOST)?)
    } else {
        None
    };

    let mut context = BTreeMap::from([
        (WEBHOOK_PORT_VAR, webhook_port.to_string()),
        (WEBHOOK_CERT_DIR_VAR, webhook_cert_dir.display().to_string()),
    ]);
    if let Some(addr) = &health_addr {
        context.insert(HEALTH_ADDR_VAR, addr.host_port());
    }

    let rendered = args
        .iter()
        .map(|arg| {
            env.render_str(arg, &context)
                .map_err(|e| template_err(arg, e))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RenderedArgs {
        args: rendered,
        health_addr,
    })
}
