//! Human input collection
//!
//! A user-input task suspends its instance until a form submission
//! arrives through the intake surface. The operator validates the
//! submission; invalid input re-suspends the task with the validation
//! errors in its output so the UI can surface them, and clears the input
//! slot for the next delivery.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use civiflow_core::context::input_key;
use civiflow_core::operator::{waiting_for, Operator, TaskContext, TaskResult};

/// One field of an input form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    /// Validation regex applied to string values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl FormField {
    /// A required field of the given type
    pub fn required(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: true,
            pattern: None,
        }
    }

    /// An optional field of the given type
    pub fn optional(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: false,
            pattern: None,
        }
    }

    /// Attach a validation pattern
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// Configuration for an input form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormConfig {
    pub title: String,
    pub fields: Vec<FormField>,
}

impl FormConfig {
    /// A form with the given title and fields
    pub fn new(title: impl Into<String>, fields: Vec<FormField>) -> Self {
        Self {
            title: title.into(),
            fields,
        }
    }

    /// Template: personal identity data
    pub fn identity_form() -> Self {
        Self::new(
            "Datos de Identidad",
            vec![
                FormField::required("nombre", "text"),
                FormField::required("rfc", "text")
                    .with_pattern("^[A-Z]{4}[0-9]{6}[A-Z0-9]{3}$"),
                FormField::required("curp", "text")
                    .with_pattern("^[A-Z]{4}[0-9]{6}[HM][A-Z]{5}[0-9]{2}$"),
                FormField::required("direccion", "text"),
                FormField::optional("telefono", "tel"),
                FormField::optional("email", "email"),
            ],
        )
    }

    /// Template: property data
    pub fn property_form() -> Self {
        Self::new(
            "Datos del Inmueble",
            vec![
                FormField::required("clave_catastral", "text"),
                FormField::required("direccion_inmueble", "text"),
                FormField::required("superficie", "number"),
                FormField::required("uso_suelo", "select"),
                FormField::optional("valor_catastral", "number"),
            ],
        )
    }
}

/// Collects input from a user
///
/// Self-contained: it knows only which form it needs filled, not what the
/// surrounding workflow does with the answers. On completion the
/// submission is published under `"{task_id}_data"`.
pub struct UserInputOperator {
    task_id: String,
    form: FormConfig,
    validators: Vec<(String, Regex)>,
    timeout: Option<Duration>,
    assignee: Option<String>,
}

impl UserInputOperator {
    /// Create a user-input operator for the given form
    ///
    /// # Errors
    ///
    /// Fails when a field's validation pattern is not a valid regex.
    pub fn new(task_id: impl Into<String>, form: FormConfig) -> Result<Self, regex::Error> {
        let mut validators = vec![];
        for field in &form.fields {
            if let Some(pattern) = &field.pattern {
                validators.push((field.name.clone(), Regex::new(pattern)?));
            }
        }
        Ok(Self {
            task_id: task_id.into(),
            form,
            validators,
            timeout: Some(Duration::from_secs(24 * 60 * 60)),
            assignee: None,
        })
    }

    /// Set the input timeout (measured from first suspension)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable the input timeout
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Assign the task to a user or team
    pub fn assigned_to(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    fn validate(&self, input: &Map<String, Value>) -> Vec<String> {
        let mut errors = vec![];

        for field in &self.form.fields {
            if field.required {
                let missing = match input.get(&field.name) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => s.is_empty(),
                    Some(_) => false,
                };
                if missing {
                    errors.push(format!("campo requerido: {}", field.name));
                }
            }
        }

        for (field_name, pattern) in &self.validators {
            if let Some(Value::String(value)) = input.get(field_name) {
                if !pattern.is_match(value) {
                    errors.push(format!("formato inválido: {field_name}"));
                }
            }
        }

        errors
    }
}

#[async_trait]
impl Operator for UserInputOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "user_input"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        if let Some(assignee) = &self.assignee {
            ctx.assign_to(assignee.clone());
        }

        let submission = ctx
            .input()
            .filter(|v| !v.is_null())
            .and_then(Value::as_object)
            .cloned();

        let Some(submission) = submission else {
            // No input yet; publish the form so the UI can render it.
            ctx.log_info("input requested", None);
            let mut data = Map::new();
            data.insert(
                format!("{}_form", self.task_id),
                serde_json::to_value(&self.form).unwrap_or(Value::Null),
            );
            return TaskResult::waiting(data, waiting_for::USER_INPUT);
        };

        let errors = self.validate(&submission);
        if !errors.is_empty() {
            ctx.log_warning(
                "input validation failed",
                Some(&Value::Array(
                    errors.iter().cloned().map(Value::String).collect(),
                )),
            );
            // Clear the input slot so the next delivery is observed, and
            // surface the errors for the UI.
            let mut data = Map::new();
            data.insert(input_key(&self.task_id), Value::Null);
            data.insert(
                format!("{}_validation_errors", self.task_id),
                Value::Array(errors.into_iter().map(Value::String).collect()),
            );
            return TaskResult::waiting(data, waiting_for::USER_INPUT);
        }

        ctx.log_info("input accepted", None);
        let mut data = Map::new();
        data.insert(
            format!("{}_data", self.task_id),
            Value::Object(submission),
        );
        data.insert(format!("{}_valid", self.task_id), Value::Bool(true));
        data.insert(
            format!("{}_validation_errors", self.task_id),
            Value::Array(vec![]),
        );
        TaskResult::done(data)
    }
}
