//! Configuration validation utilities.
//!
//! A small schema framework for validating TOML configuration tables
//! before any service is constructed. Schemas are hierarchical: a field
//! may itself be a table validated by a nested schema, and individual
//! fields may carry custom validator closures for constraints that go
//! beyond type checks.

use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ValidationError {
	/// A required field is missing.
	#[error("Missing required field: {0}")]
	MissingField(String),
	/// A field is present but its value violates a constraint.
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	/// A field has the wrong TOML type.
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
	/// Deserializing the validated config into its struct failed.
	#[error("Failed to deserialize config: {0}")]
	DeserializationError(String),
}

/// The expected type of a configuration field.
#[derive(Debug)]
pub enum FieldType {
	/// A string value.
	String,
	/// An integer value with optional inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	/// A boolean value.
	Boolean,
	/// An array whose elements all share one type.
	Array(Box<FieldType>),
	/// A nested table validated by its own schema.
	Table(Schema),
}

/// Custom validator closure for a single field.
///
/// Runs after the type check and returns an error message when the
/// value violates a constraint the type system cannot express.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field in a configuration schema.
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
	/// Creates a new field with the given name and expected type.
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a custom validator to this field.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}
}

/// A validation schema for one TOML table: fields that must be present
/// and fields that may be.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Validates a TOML value against this schema.
	///
	/// Checks that required fields are present, that every present
	/// field has the expected type, runs custom validators, and
	/// recurses into nested tables.
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
			check_field(&field.name, value, field)?;
		}

		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				check_field(&field.name, value, field)?;
			}
		}

		Ok(())
	}
}

fn check_field(name: &str, value: &toml::Value, field: &Field) -> Result<(), ValidationError> {
	check_type(name, value, &field.field_type)?;
	if let Some(validator) = &field.validator {
		validator(value).map_err(|msg| ValidationError::InvalidValue {
			field: name.to_string(),
			message: msg,
		})?;
	}
	Ok(())
}

fn check_type(
	field_name: &str,
	value: &toml::Value,
	expected: &FieldType,
) -> Result<(), ValidationError> {
	let mismatch = |expected: &str| ValidationError::TypeMismatch {
		field: field_name.to_string(),
		expected: expected.to_string(),
		actual: value.type_str().to_string(),
	};

	match expected {
		FieldType::String => {
			if !value.is_str() {
				return Err(mismatch("string"));
			}
		},
		FieldType::Integer { min, max } => {
			let int_val = value.as_integer().ok_or_else(|| mismatch("integer"))?;
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
		},
		FieldType::Boolean => {
			if !value.is_bool() {
				return Err(mismatch("boolean"));
			}
		},
		FieldType::Array(inner) => {
			let array = value.as_array().ok_or_else(|| mismatch("array"))?;
			for (i, item) in array.iter().enumerate() {
				check_type(&format!("{}[{}]", field_name, i), item, inner)?;
			}
		},
		FieldType::Table(schema) => {
			schema.validate(value).map_err(|e| prefix_field(field_name, e))?;
		},
	}

	Ok(())
}

/// Prefixes nested validation errors with the enclosing field name so
/// reports read as dotted paths from the root table.
fn prefix_field(prefix: &str, err: ValidationError) -> ValidationError {
	match err {
		ValidationError::MissingField(f) => {
			ValidationError::MissingField(format!("{}.{}", prefix, f))
		},
		ValidationError::InvalidValue { field, message } => ValidationError::InvalidValue {
			field: format!("{}.{}", prefix, field),
			message,
		},
		ValidationError::TypeMismatch {
			field,
			expected,
			actual,
		} => ValidationError::TypeMismatch {
			field: format!("{}.{}", prefix, field),
			expected,
			actual,
		},
		other => other,
	}
}

/// Trait for pluggable configuration schemas.
///
/// Each backend implementation exposes its expected configuration
/// through this trait so the factory registry can validate the config
/// table before constructing anything.
pub trait ConfigSchema: Send + Sync {
	/// Validates a TOML configuration value against this schema.
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(s: &str) -> toml::Value {
		s.parse().unwrap()
	}

	#[test]
	fn missing_required_field_is_reported() {
		let schema = Schema::new(vec![Field::new("storage_path", FieldType::String)], vec![]);
		let result = schema.validate(&parse("other = 1"));
		assert!(matches!(result, Err(ValidationError::MissingField(f)) if f == "storage_path"));
	}

	#[test]
	fn integer_bounds_are_enforced() {
		let schema = Schema::new(
			vec![Field::new(
				"max_attempts",
				FieldType::Integer {
					min: Some(1),
					max: Some(10),
				},
			)],
			vec![],
		);
		assert!(schema.validate(&parse("max_attempts = 5")).is_ok());
		assert!(schema.validate(&parse("max_attempts = 0")).is_err());
		assert!(schema.validate(&parse("max_attempts = 11")).is_err());
	}

	#[test]
	fn nested_table_errors_carry_dotted_path() {
		let schema = Schema::new(
			vec![Field::new(
				"retry",
				FieldType::Table(Schema::new(
					vec![Field::new("initial_delay_ms", FieldType::Integer { min: Some(1), max: None })],
					vec![],
				)),
			)],
			vec![],
		);
		let result = schema.validate(&parse("[retry]\nother = 1"));
		assert!(
			matches!(result, Err(ValidationError::MissingField(f)) if f == "retry.initial_delay_ms")
		);
	}
}
