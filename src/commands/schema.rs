//! Recursive property schemas for command parameters, progress, and
//! results.
//!
//! A schema is a tagged union over integer/number/string/boolean/object/
//! array with optional constraints. Definition files may use the shorthand
//! `"propName": "integer"`; [`normalize`] expands that to the full
//! `{"type": "integer"}` form so vendor overlays can be deep-merged onto
//! base definitions key-by-key.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::{domain, Error, Result};

/// Validation error codes, in the `gcd` domain.
pub mod codes {
    pub const TYPE_MISMATCH: &str = "type_mismatch";
    pub const PROPERTY_MISSING: &str = "property_missing";
    pub const UNKNOWN_PROPERTY: &str = "unknown_property";
    pub const OUT_OF_RANGE: &str = "out_of_range";
    pub const INVALID_SCHEMA: &str = "invalid_schema";
}

fn validation_error(code: &str, message: impl Into<String>) -> Error {
    Error::new(domain::GCD, code.to_string(), message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Integer,
    Number,
    String,
    Boolean,
    Object,
    Array,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::Integer => "integer",
            SchemaKind::Number => "number",
            SchemaKind::String => "string",
            SchemaKind::Boolean => "boolean",
            SchemaKind::Object => "object",
            SchemaKind::Array => "array",
        }
    }

    pub fn parse(value: &str) -> Option<SchemaKind> {
        match value {
            "integer" => Some(SchemaKind::Integer),
            "number" => Some(SchemaKind::Number),
            "string" => Some(SchemaKind::String),
            "boolean" => Some(SchemaKind::Boolean),
            "object" => Some(SchemaKind::Object),
            "array" => Some(SchemaKind::Array),
            _ => None,
        }
    }
}

/// A parsed property schema.
#[derive(Debug, Clone)]
pub struct PropertySchema {
    pub kind: SchemaKind,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub pattern: Option<Regex>,
    pub enum_values: Option<Vec<Value>>,
    /// Object properties, in definition order.
    pub properties: BTreeMap<String, PropertySchema>,
    /// Array item schema.
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    fn of_kind(kind: SchemaKind) -> Self {
        PropertySchema {
            kind,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            pattern: None,
            enum_values: None,
            properties: BTreeMap::new(),
            items: None,
        }
    }

    /// An empty object schema (no declared properties).
    pub fn empty_object() -> Self {
        Self::of_kind(SchemaKind::Object)
    }

    /// Parse a normalized schema JSON object (see [`normalize`]).
    pub fn parse(value: &Value) -> Result<PropertySchema> {
        let obj = value.as_object().ok_or_else(|| {
            validation_error(codes::INVALID_SCHEMA, "schema must be an object")
        })?;
        let kind_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| validation_error(codes::INVALID_SCHEMA, "schema lacks a type"))?;
        let kind = SchemaKind::parse(kind_str).ok_or_else(|| {
            validation_error(codes::INVALID_SCHEMA, format!("unknown type '{kind_str}'"))
        })?;

        let mut schema = PropertySchema::of_kind(kind);
        schema.minimum = obj.get("minimum").and_then(Value::as_f64);
        schema.maximum = obj.get("maximum").and_then(Value::as_f64);
        schema.min_length = obj.get("minLength").and_then(Value::as_u64);
        schema.max_length = obj.get("maxLength").and_then(Value::as_u64);
        if let Some(pattern) = obj.get("pattern").and_then(Value::as_str) {
            let compiled = Regex::new(pattern).map_err(|e| {
                validation_error(codes::INVALID_SCHEMA, format!("bad pattern: {e}"))
            })?;
            schema.pattern = Some(compiled);
        }
        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            schema.enum_values = Some(values.clone());
        }
        if kind == SchemaKind::Object {
            if let Some(props) = obj.get("properties").and_then(Value::as_object) {
                for (name, prop) in props {
                    schema
                        .properties
                        .insert(name.clone(), PropertySchema::parse(prop)?);
                }
            }
        }
        if kind == SchemaKind::Array {
            let item = obj.get("items").ok_or_else(|| {
                validation_error(codes::INVALID_SCHEMA, "array schema lacks items")
            })?;
            schema.items = Some(Box::new(PropertySchema::parse(item)?));
        }
        Ok(schema)
    }

    /// Parse a map of `property name -> schema` (the shape used for
    /// `parameters`, `progress`, and `results` blocks) into one object
    /// schema.
    pub fn parse_object_block(value: &Value) -> Result<PropertySchema> {
        let obj = value.as_object().ok_or_else(|| {
            validation_error(codes::INVALID_SCHEMA, "definition block must be an object")
        })?;
        let mut schema = PropertySchema::empty_object();
        for (name, prop) in obj {
            schema
                .properties
                .insert(name.clone(), PropertySchema::parse(prop)?);
        }
        Ok(schema)
    }

    /// Validate an instance value against this schema.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match self.kind {
            SchemaKind::Integer => {
                if value.as_i64().is_none() && value.as_u64().is_none() {
                    return Err(type_mismatch(value, "integer"));
                }
                self.check_range(value.as_f64().unwrap_or_default())?;
            }
            SchemaKind::Number => {
                let number = value.as_f64().ok_or_else(|| type_mismatch(value, "number"))?;
                self.check_range(number)?;
            }
            SchemaKind::String => {
                let text = value.as_str().ok_or_else(|| type_mismatch(value, "string"))?;
                let length = text.chars().count() as u64;
                if let Some(min) = self.min_length {
                    if length < min {
                        return Err(validation_error(
                            codes::OUT_OF_RANGE,
                            format!("string shorter than minLength {min}"),
                        ));
                    }
                }
                if let Some(max) = self.max_length {
                    if length > max {
                        return Err(validation_error(
                            codes::OUT_OF_RANGE,
                            format!("string longer than maxLength {max}"),
                        ));
                    }
                }
                if let Some(pattern) = &self.pattern {
                    if !pattern.is_match(text) {
                        return Err(validation_error(
                            codes::OUT_OF_RANGE,
                            format!("string does not match pattern '{}'", pattern.as_str()),
                        ));
                    }
                }
            }
            SchemaKind::Boolean => {
                if !value.is_boolean() {
                    return Err(type_mismatch(value, "boolean"));
                }
            }
            SchemaKind::Object => {
                let obj = value.as_object().ok_or_else(|| type_mismatch(value, "object"))?;
                for (name, prop_schema) in &self.properties {
                    match obj.get(name) {
                        Some(prop_value) => prop_schema.validate(prop_value).map_err(|e| {
                            Error::wrap(
                                domain::GCD,
                                e.code().to_string(),
                                format!("invalid value for property '{name}'"),
                                e,
                            )
                        })?,
                        None => {
                            return Err(validation_error(
                                codes::PROPERTY_MISSING,
                                format!("required parameter missing: {name}"),
                            ))
                        }
                    }
                }
                for name in obj.keys() {
                    if !self.properties.contains_key(name) {
                        return Err(validation_error(
                            codes::UNKNOWN_PROPERTY,
                            format!("unrecognized parameter '{name}'"),
                        ));
                    }
                }
            }
            SchemaKind::Array => {
                let list = value.as_array().ok_or_else(|| type_mismatch(value, "array"))?;
                let item_schema = self.items.as_deref().ok_or_else(|| {
                    validation_error(codes::INVALID_SCHEMA, "array schema lacks items")
                })?;
                for item in list {
                    item_schema.validate(item)?;
                }
            }
        }

        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                return Err(validation_error(
                    codes::OUT_OF_RANGE,
                    format!("value {value} is not one of the allowed values"),
                ));
            }
        }
        Ok(())
    }

    fn check_range(&self, number: f64) -> Result<()> {
        if let Some(min) = self.minimum {
            if number < min {
                return Err(validation_error(
                    codes::OUT_OF_RANGE,
                    format!("value {number} is below minimum {min}"),
                ));
            }
        }
        if let Some(max) = self.maximum {
            if number > max {
                return Err(validation_error(
                    codes::OUT_OF_RANGE,
                    format!("value {number} is above maximum {max}"),
                ));
            }
        }
        Ok(())
    }

    /// Check that `self` only tightens `base`: same type, narrower numeric
    /// and length bounds, enum subset. New object properties are allowed;
    /// inherited ones are checked recursively.
    pub fn tightens(&self, base: &PropertySchema) -> Result<()> {
        if self.kind != base.kind {
            return Err(validation_error(
                codes::INVALID_SCHEMA,
                format!(
                    "type changed from {} to {}",
                    base.kind.as_str(),
                    self.kind.as_str()
                ),
            ));
        }
        check_bound_raised("minimum", self.minimum, base.minimum)?;
        check_bound_lowered("maximum", self.maximum, base.maximum)?;
        check_bound_raised(
            "minLength",
            self.min_length.map(|v| v as f64),
            base.min_length.map(|v| v as f64),
        )?;
        check_bound_lowered(
            "maxLength",
            self.max_length.map(|v| v as f64),
            base.max_length.map(|v| v as f64),
        )?;
        if let (Some(ours), Some(theirs)) = (&self.enum_values, &base.enum_values) {
            if !ours.iter().all(|v| theirs.contains(v)) {
                return Err(validation_error(
                    codes::INVALID_SCHEMA,
                    "enum is not a subset of the base enum",
                ));
            }
        } else if self.enum_values.is_none() && base.enum_values.is_some() {
            return Err(validation_error(
                codes::INVALID_SCHEMA,
                "base enum constraint was dropped",
            ));
        }
        for (name, base_prop) in &base.properties {
            if let Some(our_prop) = self.properties.get(name) {
                our_prop.tightens(base_prop).map_err(|e| {
                    Error::wrap(
                        domain::GCD,
                        e.code().to_string(),
                        format!("property '{name}' contradicts base"),
                        e,
                    )
                })?;
            }
        }
        if let (Some(ours), Some(theirs)) = (&self.items, &base.items) {
            ours.tightens(theirs)?;
        }
        Ok(())
    }
}

fn type_mismatch(value: &Value, expected: &str) -> Error {
    validation_error(
        codes::TYPE_MISMATCH,
        format!("unable to convert value {value} into {expected}"),
    )
}

fn check_bound_raised(name: &str, ours: Option<f64>, base: Option<f64>) -> Result<()> {
    if let Some(base) = base {
        match ours {
            Some(ours) if ours >= base => Ok(()),
            Some(_) => Err(validation_error(
                codes::INVALID_SCHEMA,
                format!("{name} loosened below base"),
            )),
            None => Err(validation_error(
                codes::INVALID_SCHEMA,
                format!("base {name} constraint was dropped"),
            )),
        }
    } else {
        Ok(())
    }
}

fn check_bound_lowered(name: &str, ours: Option<f64>, base: Option<f64>) -> Result<()> {
    if let Some(base) = base {
        match ours {
            Some(ours) if ours <= base => Ok(()),
            Some(_) => Err(validation_error(
                codes::INVALID_SCHEMA,
                format!("{name} loosened above base"),
            )),
            None => Err(validation_error(
                codes::INVALID_SCHEMA,
                format!("base {name} constraint was dropped"),
            )),
        }
    } else {
        Ok(())
    }
}

/// Expand shorthand schemas (`"integer"`) into the full object form, in
/// place, recursing through `properties` blocks. `value` is a map of
/// `property name -> schema`.
pub fn normalize_block(value: &Value) -> Result<Value> {
    let obj = value.as_object().ok_or_else(|| {
        validation_error(codes::INVALID_SCHEMA, "definition block must be an object")
    })?;
    let mut out = Map::new();
    for (name, prop) in obj {
        out.insert(name.clone(), normalize_schema(prop)?);
    }
    Ok(Value::Object(out))
}

fn normalize_schema(value: &Value) -> Result<Value> {
    match value {
        Value::String(kind) => {
            if SchemaKind::parse(kind).is_none() {
                return Err(validation_error(
                    codes::INVALID_SCHEMA,
                    format!("unknown type '{kind}'"),
                ));
            }
            Ok(json!({ "type": kind }))
        }
        Value::Object(obj) => {
            let mut out = obj.clone();
            if let Some(props) = obj.get("properties") {
                out.insert("properties".into(), normalize_block(props)?);
            }
            if let Some(items) = obj.get("items") {
                out.insert("items".into(), normalize_schema(items)?);
            }
            Ok(Value::Object(out))
        }
        other => Err(validation_error(
            codes::INVALID_SCHEMA,
            format!("schema must be a type name or object, got {other}"),
        )),
    }
}

/// Deep merge `overlay` onto `base`; maps merge key-wise, everything else
/// is replaced by the overlay.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let entry = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}
