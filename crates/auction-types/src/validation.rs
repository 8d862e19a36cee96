//! Schema validation for implementation-specific TOML configuration.
//!
//! Each pluggable backend (storage, time-lock oracle, block source, price
//! oracle, delivery) describes the table it expects through a [`Schema`].
//! The config loader runs these schemas before any backend is constructed.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
	#[error("Failed to deserialize config: {0}")]
	DeserializationError(String),
}

impl ValidationError {
	/// Prefixes the field path with the name of the enclosing table.
	fn nested(self, parent: &str) -> Self {
		match self {
			ValidationError::MissingField(f) => {
				ValidationError::MissingField(format!("{}.{}", parent, f))
			}
			ValidationError::InvalidValue { field, message } => ValidationError::InvalidValue {
				field: format!("{}.{}", parent, field),
				message,
			},
			ValidationError::TypeMismatch {
				field,
				expected,
				actual,
			} => ValidationError::TypeMismatch {
				field: format!("{}.{}", parent, field),
				expected,
				actual,
			},
			other => other,
		}
	}
}

#[derive(Debug)]
pub enum FieldType {
	String,
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
	/// A decimal number written as a TOML string (`"1850.25"`) so that no
	/// precision is lost to floating point.
	Decimal,
	Array(Box<FieldType>),
	Table(Schema),
}

pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a check that runs after the type check passed.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		validate_field_type(&self.name, value, &self.field_type)?;
		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of one configuration table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// A schema that accepts any table.
	pub fn empty() -> Self {
		Self::new(vec![], vec![])
	}

	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| ValidationError::TypeMismatch {
				field: "root".to_string(),
				expected: "table".to_string(),
				actual: config.type_str().to_string(),
			})?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}

		Ok(())
	}
}

fn mismatch(field_name: &str, expected: &str, value: &toml::Value) -> ValidationError {
	ValidationError::TypeMismatch {
		field: field_name.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	}
}

fn validate_field_type(
	field_name: &str,
	value: &toml::Value,
	expected_type: &FieldType,
) -> Result<(), ValidationError> {
	match expected_type {
		FieldType::String => {
			if !value.is_str() {
				return Err(mismatch(field_name, "string", value));
			}
		}
		FieldType::Integer { min, max } => {
			let int_val = value
				.as_integer()
				.ok_or_else(|| mismatch(field_name, "integer", value))?;

			if let Some(min_val) = min {
				if int_val < *min_val {
					return Err(ValidationError::InvalidValue {
						field: field_name.to_string(),
						message: format!("Value {} is less than minimum {}", int_val, min_val),
					});
				}
			}
			if let Some(max_val) = max {
				if int_val > *max_val {
					return Err(ValidationError::InvalidValue {
						field: field_name.to_string(),
						message: format!("Value {} is greater than maximum {}", int_val, max_val),
					});
				}
			}
		}
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(mismatch(field_name, "boolean", value));
			}
		}
		FieldType::Decimal => {
			let text = value
				.as_str()
				.ok_or_else(|| mismatch(field_name, "decimal string", value))?;
			decimal(text).map_err(|message| ValidationError::InvalidValue {
				field: field_name.to_string(),
				message,
			})?;
		}
		FieldType::Array(inner_type) => {
			let array = value
				.as_array()
				.ok_or_else(|| mismatch(field_name, "array", value))?;
			for (i, item) in array.iter().enumerate() {
				validate_field_type(&format!("{}[{}]", field_name, i), item, inner_type)?;
			}
		}
		FieldType::Table(schema) => {
			schema
				.validate(value)
				.map_err(|e| e.nested(field_name))?;
		}
	}

	Ok(())
}

/// Parses a decimal string, rejecting anything `rust_decimal` cannot represent.
pub fn decimal(text: &str) -> Result<Decimal, String> {
	Decimal::from_str(text.trim()).map_err(|e| format!("'{}' is not a decimal: {}", text, e))
}

/// Validator for `http://` and `https://` endpoints.
pub fn http_url(value: &toml::Value) -> Result<(), String> {
	let url = value.as_str().ok_or("expected a string")?;
	if url.starts_with("http://") || url.starts_with("https://") {
		Ok(())
	} else {
		Err(format!("'{}' must start with http:// or https://", url))
	}
}

/// Validator for 20-byte hex addresses.
pub fn hex_address(value: &toml::Value) -> Result<(), String> {
	let text = value.as_str().ok_or("expected a string")?;
	let bytes = crate::serde_hex::decode(text).map_err(|e| format!("invalid hex: {}", e))?;
	if bytes.len() != 20 {
		return Err(format!("address must be 20 bytes, got {}", bytes.len()));
	}
	Ok(())
}

/// Validator for strings that must carry content.
pub fn non_empty(value: &toml::Value) -> Result<(), String> {
	match value.as_str() {
		Some(text) if !text.trim().is_empty() => Ok(()),
		Some(_) => Err("must not be empty".to_string()),
		None => Err("expected a string".to_string()),
	}
}

/// Implemented by every pluggable backend to validate its own table.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}

impl ConfigSchema for Schema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::validate(self, config)
	}
}
