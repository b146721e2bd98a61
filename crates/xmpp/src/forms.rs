//! XEP-0004 data forms, as used for node configuration.

use std::fmt;
use std::str::FromStr;

use minidom::Element;

use crate::error::FormError;
use crate::stanza::NS_DATA_FORMS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormType {
    #[default]
    Form,
    Submit,
    Cancel,
    Result,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Form => "form",
            FormType::Submit => "submit",
            FormType::Cancel => "cancel",
            FormType::Result => "result",
        }
    }
}

impl FromStr for FormType {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(FormType::Form),
            "submit" => Ok(FormType::Submit),
            "cancel" => Ok(FormType::Cancel),
            "result" => Ok(FormType::Result),
            other => Err(FormError::UnknownFormType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    Boolean,
    Fixed,
    Hidden,
    JidMulti,
    JidSingle,
    ListMulti,
    ListSingle,
    TextMulti,
    TextPrivate,
    #[default]
    TextSingle,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Fixed => "fixed",
            FieldType::Hidden => "hidden",
            FieldType::JidMulti => "jid-multi",
            FieldType::JidSingle => "jid-single",
            FieldType::ListMulti => "list-multi",
            FieldType::ListSingle => "list-single",
            FieldType::TextMulti => "text-multi",
            FieldType::TextPrivate => "text-private",
            FieldType::TextSingle => "text-single",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(FieldType::Boolean),
            "fixed" => Ok(FieldType::Fixed),
            "hidden" => Ok(FieldType::Hidden),
            "jid-multi" => Ok(FieldType::JidMulti),
            "jid-single" => Ok(FieldType::JidSingle),
            "list-multi" => Ok(FieldType::ListMulti),
            "list-single" => Ok(FieldType::ListSingle),
            "text-multi" => Ok(FieldType::TextMulti),
            "text-private" => Ok(FieldType::TextPrivate),
            "text-single" => Ok(FieldType::TextSingle),
            other => Err(FormError::UnknownFieldType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormOption {
    pub label: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormField {
    pub var: String,
    pub field_type: FieldType,
    pub label: Option<String>,
    pub desc: Option<String>,
    pub required: bool,
    pub values: Vec<String>,
    pub options: Vec<FormOption>,
}

impl FormField {
    pub fn hidden(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            field_type: FieldType::Hidden,
            values: vec![value.into()],
            ..Default::default()
        }
    }

    pub fn text_single(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            values: vec![value.into()],
            ..Default::default()
        }
    }

    /// The first value, if any.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    pub fn to_element(&self) -> Element {
        let mut field = Element::builder("field", NS_DATA_FORMS)
            .attr("var", self.var.as_str())
            .attr("type", self.field_type.as_str());

        if let Some(label) = &self.label {
            field = field.attr("label", label.as_str());
        }
        if let Some(desc) = &self.desc {
            field = field.append(Element::builder("desc", NS_DATA_FORMS).append(desc.as_str()).build());
        }
        if self.required {
            field = field.append(Element::builder("required", NS_DATA_FORMS).build());
        }
        for value in &self.values {
            field = field.append(Element::builder("value", NS_DATA_FORMS).append(value.as_str()).build());
        }
        for option in &self.options {
            let mut opt = Element::builder("option", NS_DATA_FORMS);
            if let Some(label) = &option.label {
                opt = opt.attr("label", label.as_str());
            }
            field = field.append(
                opt.append(
                    Element::builder("value", NS_DATA_FORMS)
                        .append(option.value.as_str())
                        .build(),
                )
                .build(),
            );
        }

        field.build()
    }

    pub fn from_element(field: &Element) -> Result<Self, FormError> {
        let field_type = match field.attr("type") {
            Some(t) => t.parse()?,
            None => FieldType::default(),
        };

        let mut parsed = FormField {
            var: field.attr("var").unwrap_or("").to_string(),
            field_type,
            label: field.attr("label").map(String::from),
            ..Default::default()
        };

        for child in field.children() {
            if child.ns() != NS_DATA_FORMS {
                continue;
            }
            match child.name() {
                "desc" => parsed.desc = Some(child.text()),
                "required" => parsed.required = true,
                "value" => parsed.values.push(child.text()),
                "option" => parsed.options.push(FormOption {
                    label: child.attr("label").map(String::from),
                    value: child
                        .get_child("value", NS_DATA_FORMS)
                        .map(|v| v.text())
                        .unwrap_or_default(),
                }),
                _ => {}
            }
        }

        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataForm {
    pub form_type: FormType,
    pub title: Option<String>,
    pub instructions: Option<String>,
    pub fields: Vec<FormField>,
}

impl DataForm {
    /// A submit form whose first field is the hidden `FORM_TYPE`.
    pub fn submit(form_type_ns: &str, fields: impl IntoIterator<Item = FormField>) -> Self {
        let mut all = vec![FormField::hidden("FORM_TYPE", form_type_ns)];
        all.extend(fields);
        Self {
            form_type: FormType::Submit,
            fields: all,
            ..Default::default()
        }
    }

    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    pub fn to_element(&self) -> Element {
        let mut form = Element::builder("x", NS_DATA_FORMS).attr("type", self.form_type.as_str());

        if let Some(title) = &self.title {
            form = form.append(Element::builder("title", NS_DATA_FORMS).append(title.as_str()).build());
        }
        if let Some(instructions) = &self.instructions {
            form = form.append(
                Element::builder("instructions", NS_DATA_FORMS)
                    .append(instructions.as_str())
                    .build(),
            );
        }
        for field in &self.fields {
            form = form.append(field.to_element());
        }

        form.build()
    }

    pub fn from_element(form: &Element) -> Result<Self, FormError> {
        if !form.is("x", NS_DATA_FORMS) {
            return Err(FormError::NotAForm(form.name().to_string()));
        }

        let form_type = match form.attr("type") {
            Some(t) => t.parse()?,
            None => FormType::default(),
        };

        let mut parsed = DataForm {
            form_type,
            ..Default::default()
        };

        for child in form.children() {
            if child.ns() != NS_DATA_FORMS {
                continue;
            }
            match child.name() {
                "title" => parsed.title = Some(child.text()),
                "instructions" => parsed.instructions = Some(child.text()),
                "field" => parsed.fields.push(FormField::from_element(child)?),
                _ => {}
            }
        }

        Ok(parsed)
    }
}
