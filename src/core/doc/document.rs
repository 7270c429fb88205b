// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

/// Describes the attributes of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    pub indexed: bool,
    pub tokenized: bool,
    pub stored: bool,
}

impl FieldType {
    /// Indexed, tokenized and stored.
    pub const TEXT_STORED: FieldType = FieldType {
        indexed: true,
        tokenized: true,
        stored: true,
    };
    /// Indexed and tokenized, not stored.
    pub const TEXT: FieldType = FieldType {
        indexed: true,
        tokenized: true,
        stored: false,
    };
    /// Indexed verbatim as a single token and stored, e.g. a primary key.
    pub const STRING: FieldType = FieldType {
        indexed: true,
        tokenized: false,
        stored: true,
    };
    pub const STORED_ONLY: FieldType = FieldType {
        indexed: false,
        tokenized: false,
        stored: true,
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: &str, value: &str, field_type: FieldType) -> Field {
        Field {
            name: name.to_string(),
            value: value.to_string(),
            field_type,
        }
    }

    pub fn text(name: &str, value: &str) -> Field {
        Field::new(name, value, FieldType::TEXT_STORED)
    }

    pub fn string(name: &str, value: &str) -> Field {
        Field::new(name, value, FieldType::STRING)
    }
}

/// Documents are the unit of indexing and search.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Document {
        Document { fields: Vec::new() }
    }

    pub fn with_fields(fields: Vec<Field>) -> Document {
        Document { fields }
    }

    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Returns the value of the first field with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}
