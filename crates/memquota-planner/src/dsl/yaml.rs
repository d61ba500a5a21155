//! YAML → `Program` front end.
//!
//! Example (a loop allocating 1 MiB per iteration):
//! ```yaml
//! quota: { limit: 67108864, handler_type: QuotaInfringementHandler, handler_method: handle }
//! program:
//!   classes:
//!     - name: Script
//!       script: true
//!       methods:
//!         - name: run
//!           body:
//!             - let: { name: keep, init: { int: 0 } }
//!             - for:
//!                 init: { let: { name: i, init: { int: 0 } } }
//!                 cond: { binary: { op: lt, lhs: { var: i }, rhs: { int: 70 } } }
//!                 update: { assign: { name: i, value: { binary: { op: add, lhs: { var: i }, rhs: { int: 1 } } } } }
//!                 body:
//!                   block:
//!                     - assign: { name: keep, value: { new_bytes: { int: 1048576 } } }
//!             - return: { int: 5 }
//! ```
//!
//! Enums are written as single-key maps (`{ int: 5 }`); unit variants as bare
//! strings (`break`, `nil`).

use std::collections::HashSet;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use memquota_core::ast::Program;
use memquota_core::config::QuotaConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDoc {
    #[serde(default)]
    pub quota: Option<QuotaSection>,
    pub program: Program,
}

/// The quota declaration a program carries. Absent keys keep whatever the
/// lower configuration layers said.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    #[serde(alias = "limit_bytes", skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_method: Option<String>,
}

impl QuotaSection {
    pub fn apply(&self, quota: &mut QuotaConfig) {
        if let Some(limit) = self.limit {
            quota.limit_bytes = limit;
        }
        if let Some(t) = &self.handler_type {
            quota.handler_type = t.clone();
        }
        if let Some(m) = &self.handler_method {
            quota.handler_method = m.clone();
        }
    }
}

impl From<&QuotaConfig> for QuotaSection {
    fn from(q: &QuotaConfig) -> Self {
        Self {
            limit: Some(q.limit_bytes),
            handler_type: Some(q.handler_type.clone()),
            handler_method: Some(q.handler_method.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedProgram {
    pub program: Program,
    pub quota: QuotaSection,
}

pub fn parse_yaml_program(yaml_src: &str) -> Result<ParsedProgram, serde_yaml::Error> {
    let de = serde_yaml::Deserializer::from_str(yaml_src);
    let doc: ProgramDoc = serde_yaml::with::singleton_map_recursive::deserialize(de)?;

    let mut classes = HashSet::new();
    let mut scripts = 0usize;
    for class in &doc.program.classes {
        if !classes.insert(class.name.as_str()) {
            return Err(serde_yaml::Error::custom(format!(
                "duplicate class '{}'",
                class.name
            )));
        }
        if class.script {
            scripts += 1;
        }
        let mut methods = HashSet::new();
        for m in &class.methods {
            if !methods.insert((m.name.as_str(), m.params.len())) {
                return Err(serde_yaml::Error::custom(format!(
                    "duplicate method '{}::{}' with {} parameter(s)",
                    class.name,
                    m.name,
                    m.params.len()
                )));
            }
        }
    }
    if scripts > 1 {
        return Err(serde_yaml::Error::custom(format!(
            "a unit has at most one script class, found {scripts}"
        )));
    }

    Ok(ParsedProgram {
        program: doc.program,
        quota: doc.quota.unwrap_or_default(),
    })
}

/// Render a program (instrumented or not) in the same form `parse_yaml_program` reads.
pub fn to_yaml_program(
    program: &Program,
    quota: Option<&QuotaConfig>,
) -> Result<String, serde_yaml::Error> {
    let doc = ProgramDoc {
        quota: quota.map(QuotaSection::from),
        program: program.clone(),
    };
    let mut out = Vec::new();
    {
        let mut ser = serde_yaml::Serializer::new(&mut out);
        serde_yaml::with::singleton_map_recursive::serialize(&doc, &mut ser)?;
    }
    String::from_utf8(out).map_err(serde_yaml::Error::custom)
}
