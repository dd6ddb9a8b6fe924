//! Jenkins integration: the REST surface used after a restart and the files
//! written into the master's home directory.

pub mod files;
pub mod rest;

pub use rest::JenkinsRestAccessor;

/// Script signatures the CPF pipeline needs, approved whenever CPF jobs exist.
pub const CPF_JOB_SCRIPT_SIGNATURES: [&str; 4] = [
    "new groovy.json.JsonSlurperClassic",
    "method groovy.json.JsonSlurperClassic parseText java.lang.String",
    "staticMethod org.codehaus.groovy.runtime.DefaultGroovyMethods matches java.lang.String java.util.regex.Pattern",
    "new java.lang.Exception java.lang.String",
];
