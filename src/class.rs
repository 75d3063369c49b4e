//! Class-file front end: parse a class, expose its methods, run the
//! per-method analysis.

use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use rayon::prelude::*;
use tracing::debug;

use crate::cfg::ExceptionHandler;
use crate::error::{Error, Result};
use crate::method::MethodAnalysis;
use crate::stream::LineNumber;

/// One method of a parsed class. Abstract and native methods carry no
/// body and never appear here.
#[derive(Debug)]
pub struct MethodNode {
    name: String,
    descriptor: String,
    bytecode: Vec<u8>,
    exception_handlers: Vec<ExceptionHandler>,
    line_numbers: Vec<LineNumber>,
}

impl MethodNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Raw bytecode of the method body.
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn exception_handlers(&self) -> &[ExceptionHandler] {
        &self.exception_handlers
    }

    pub fn line_numbers(&self) -> &[LineNumber] {
        &self.line_numbers
    }
}

/// Parsed class file, holding the constant pool the method analyses
/// resolve symbolic references through.
#[derive(Debug)]
pub struct ClassNode {
    name: String,
    super_name: Option<String>,
    constant_pool: Vec<ConstantPool>,
    methods: Vec<MethodNode>,
}

impl ClassNode {
    /// Parse class-file bytes. Methods without a Code attribute are
    /// dropped here; everything else is kept for later analysis.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let class_file = class_file::parse(data).map_err(|error| Error::ClassFormat {
            message: error.to_string(),
        })?;
        let constant_pool = class_file.constant_pool();

        let name = resolve_class_name(constant_pool, class_file.this_class())?;
        let super_name = if class_file.super_class() == 0 {
            None
        } else {
            Some(resolve_class_name(constant_pool, class_file.super_class())?)
        };

        let mut methods = Vec::new();
        for method in class_file.methods() {
            let method_name = resolve_utf8(constant_pool, method.name_index())?;
            let descriptor = resolve_utf8(constant_pool, method.descriptor_index())?;
            let code = method
                .attributes()
                .iter()
                .find_map(|attribute| match attribute {
                    jclassfile::attributes::Attribute::Code {
                        code,
                        exception_table,
                        attributes,
                        ..
                    } => Some((code, exception_table, attributes)),
                    _ => None,
                });
            let Some((code, exception_table, code_attributes)) = code else {
                continue;
            };
            methods.push(MethodNode {
                name: method_name,
                descriptor,
                bytecode: code.clone(),
                exception_handlers: parse_exception_handlers(exception_table, constant_pool)?,
                line_numbers: parse_line_numbers(code_attributes),
            });
        }

        debug!(class = %name, methods = methods.len(), "parsed class file");
        Ok(Self {
            name,
            super_name,
            constant_pool: constant_pool.to_vec(),
            methods,
        })
    }

    /// Internal (slash-separated) name of the class.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Internal name of the superclass, absent only for java/lang/Object.
    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn methods(&self) -> &[MethodNode] {
        &self.methods
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodNode> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    pub fn constant_pool(&self) -> &[ConstantPool] {
        &self.constant_pool
    }

    /// Analyze one method body against this class's constant pool.
    pub fn analyze(&self, method: &MethodNode) -> Result<MethodAnalysis> {
        MethodAnalysis::build(
            &method.bytecode,
            &self.constant_pool,
            &method.exception_handlers,
            &method.line_numbers,
        )
    }

    /// Analyze every method in parallel. A malformed body fails its own
    /// entry without touching the others.
    pub fn analyze_all(&self) -> Vec<(&MethodNode, Result<MethodAnalysis>)> {
        self.methods
            .par_iter()
            .map(|method| (method, self.analyze(method)))
            .collect()
    }
}

fn resolve_utf8(pool: &[ConstantPool], index: u16) -> Result<String> {
    match pool.get(index as usize) {
        Some(ConstantPool::Utf8 { value }) => Ok(value.clone()),
        _ => Err(Error::ClassFormat {
            message: format!("constant pool entry {index} is not utf8"),
        }),
    }
}

fn resolve_class_name(pool: &[ConstantPool], index: u16) -> Result<String> {
    match pool.get(index as usize) {
        Some(ConstantPool::Class { name_index }) => resolve_utf8(pool, *name_index),
        _ => Err(Error::ClassFormat {
            message: format!("constant pool entry {index} is not a class"),
        }),
    }
}

fn parse_exception_handlers(
    table: &[jclassfile::attributes::ExceptionRecord],
    constant_pool: &[ConstantPool],
) -> Result<Vec<ExceptionHandler>> {
    let mut handlers = Vec::new();
    for entry in table {
        let catch_type = if entry.catch_type() == 0 {
            None
        } else {
            Some(resolve_class_name(constant_pool, entry.catch_type())?)
        };
        handlers.push(ExceptionHandler {
            start_pc: entry.start_pc() as u32,
            end_pc: entry.end_pc() as u32,
            handler_pc: entry.handler_pc() as u32,
            catch_type,
        });
    }
    Ok(handlers)
}

fn parse_line_numbers(attributes: &[jclassfile::attributes::Attribute]) -> Vec<LineNumber> {
    let mut entries = Vec::new();
    for attribute in attributes {
        let jclassfile::attributes::Attribute::LineNumberTable { line_number_table } = attribute
        else {
            continue;
        };
        for record in line_number_table {
            entries.push(LineNumber {
                start_pc: record.start_pc() as u32,
                line: record.line_number() as u32,
            });
        }
    }
    entries.sort_by_key(|entry| entry.start_pc);
    entries
}
