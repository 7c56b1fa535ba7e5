//! Deterministic rendering of instance configuration.
//!
//! Each site section is its template content with `{{.Name}}` placeholders
//! substituted from an environment of the reserved `Origin`/`Cert` pair plus
//! the template's declared variables. The instance document is the
//! pre-config followed by every site section, double-newline separated.
//! Identical input graphs yield byte-identical output; any unresolved
//! placeholder fails the whole render.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{Result, TemplateError};
use crate::paths;
use crate::store::{Instance, SiteWithRelations};

/// Implicitly provided per-site; must not appear in template variables.
pub const RESERVED_VARIABLES: [&str; 2] = ["Origin", "Cert"];

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\.([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap());

/// Render the full configuration document for an instance whose site
/// closure has been preloaded.
pub fn render_instance_config(instance: &Instance, sites: &[SiteWithRelations]) -> Result<String> {
    let mut sections = Vec::with_capacity(sites.len() + 1);
    sections.push(instance.pre_config.clone());

    for site in sites {
        sections.push(render_site_config(site)?);
    }

    Ok(sections.join("\n\n"))
}

/// Render one site section.
pub fn render_site_config(swr: &SiteWithRelations) -> Result<String> {
    if swr.template.variables.len() != swr.site.template_values.len() {
        return Err(TemplateError::VariableCountMismatch {
            expected: swr.template.variables.len(),
            actual: swr.site.template_values.len(),
        }
        .into());
    }

    let mut env: HashMap<&str, String> = HashMap::new();
    env.insert("Origin", swr.site.origin.clone());
    env.insert("Cert", cert_fragment(swr));

    for (name, value) in swr.template.variables.iter().zip(&swr.site.template_values) {
        env.insert(name.as_str(), value.clone());
    }

    substitute(&swr.template.content, &env)
}

/// The `tls` directive for a site, or the empty string when no cert is
/// attached (the edge proxy then manages its own certificate).
fn cert_fragment(swr: &SiteWithRelations) -> String {
    let Some(cert) = &swr.cert else {
        return String::new();
    };

    let mut fragment = format!(
        "tls {} {}",
        paths::cert_leaf_path(cert.id),
        paths::cert_key_path(cert.id)
    );

    if !cert.intermediate_certificate.is_empty() {
        fragment.push_str(&format!(
            " {{\n        ca_root {}\n    }}",
            paths::cert_intermediate_path(cert.id)
        ));
    }

    fragment
}

/// Validate a template's declared variables at write time: the reserved
/// names are provided implicitly and must not be redeclared.
pub fn validate_template_variables(variables: &[String]) -> Result<()> {
    for name in variables {
        if RESERVED_VARIABLES.contains(&name.as_str()) {
            return Err(TemplateError::ReservedVariable(name.clone()).into());
        }
    }
    Ok(())
}

fn substitute(content: &str, env: &HashMap<&str, String>) -> Result<String> {
    let mut rendered = String::with_capacity(content.len());
    let mut last = 0;

    for captures in PLACEHOLDER.captures_iter(content) {
        let whole = captures.get(0).expect("capture 0 always present");
        let name = &captures[1];

        let Some(value) = env.get(name) else {
            return Err(TemplateError::UnknownVariable(name.to_string()).into());
        };

        rendered.push_str(&content[last..whole.start()]);
        rendered.push_str(value);
        last = whole.end();
    }

    rendered.push_str(&content[last..]);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{Cert, Site, Template};
    use chrono::Utc;

    fn site_with_relations(cert: Option<Cert>) -> SiteWithRelations {
        SiteWithRelations {
            site: Site {
                id: 1,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "a".into(),
                origin: "a.test".into(),
                template_id: 1,
                template_values: vec!["b.upstream".into()],
                cert_id: cert.as_ref().map(|c| c.id),
            },
            template: Template {
                id: 1,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "proxy".into(),
                description: String::new(),
                content: "{{.Origin}} {\n    {{.Cert}}\n    reverse_proxy {{.Source}}\n}".into(),
                variables: vec!["Source".into()],
            },
            cert,
        }
    }

    fn cert(id: i64, intermediate: &str) -> Cert {
        Cert {
            id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: "a-test".into(),
            domains: vec!["a.test".into()],
            provider: None,
            expires_at: None,
            certificate: "LEAF".into(),
            private_key: vec![],
            intermediate_certificate: intermediate.into(),
            csr: String::new(),
        }
    }

    fn instance(pre_config: &str) -> Instance {
        Instance {
            id: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: "edge-1".into(),
            token: uuid::Uuid::new_v4(),
            pre_config: pre_config.into(),
            is_manual_mode: false,
            additional_file_ids: vec![],
            site_ids: vec![1],
        }
    }

    #[test]
    fn test_render_with_cert() {
        let swr = site_with_relations(Some(cert(7, "")));
        let rendered = render_instance_config(&instance("{\n    email a@a.test\n}"), &[swr]).unwrap();
        assert_eq!(
            rendered,
            "{\n    email a@a.test\n}\n\na.test {\n    tls /data/cdn/certs/7/cert.pem /data/cdn/certs/7/key.pem\n    reverse_proxy b.upstream\n}"
        );
    }

    #[test]
    fn test_render_with_intermediate() {
        let swr = site_with_relations(Some(cert(7, "INTERMEDIATE")));
        let rendered = render_site_config(&swr).unwrap();
        assert!(rendered.contains(
            "tls /data/cdn/certs/7/cert.pem /data/cdn/certs/7/key.pem {\n        ca_root /data/cdn/certs/7/ca.pem\n    }"
        ));
    }

    #[test]
    fn test_render_without_cert_leaves_fragment_empty() {
        let swr = site_with_relations(None);
        let rendered = render_site_config(&swr).unwrap();
        assert_eq!(rendered, "a.test {\n    \n    reverse_proxy b.upstream\n}");
    }

    #[test]
    fn test_render_is_deterministic() {
        let swr = site_with_relations(Some(cert(7, "INTERMEDIATE")));
        let a = render_site_config(&swr).unwrap();
        let b = render_site_config(&swr).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_variable_fails_whole_render() {
        let mut swr = site_with_relations(None);
        swr.template.content = "{{.Origin}} {{.Missing}}".into();
        assert!(matches!(
            render_site_config(&swr),
            Err(Error::Template(TemplateError::UnknownVariable(name))) if name == "Missing"
        ));
    }

    #[test]
    fn test_value_count_mismatch() {
        let mut swr = site_with_relations(None);
        swr.site.template_values = vec![];
        assert!(matches!(
            render_site_config(&swr),
            Err(Error::Template(TemplateError::VariableCountMismatch { .. }))
        ));
    }

    #[test]
    fn test_reserved_variable_names_rejected() {
        assert!(validate_template_variables(&["Source".into()]).is_ok());
        assert!(validate_template_variables(&["Cert".into()]).is_err());
        assert!(validate_template_variables(&["Origin".into()]).is_err());
    }
}
