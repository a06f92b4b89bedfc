// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Search templates, converted to `cryptoki` attributes at the driver.

use cryptoki::object as ck;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AttributeType {
    #[strum(serialize = "CKA_CERTIFICATE_TYPE")]
    CertificateType,
    #[strum(serialize = "CKA_CLASS")]
    Class,
    #[strum(serialize = "CKA_ID")]
    Id,
    #[strum(serialize = "CKA_LABEL")]
    Label,
    #[strum(serialize = "CKA_SIGN")]
    Sign,
    #[strum(serialize = "CKA_VALUE")]
    Value,
}

impl From<AttributeType> for ck::AttributeType {
    fn from(attribute_type: AttributeType) -> Self {
        match attribute_type {
            AttributeType::CertificateType => ck::AttributeType::CertificateType,
            AttributeType::Class => ck::AttributeType::Class,
            AttributeType::Id => ck::AttributeType::Id,
            AttributeType::Label => ck::AttributeType::Label,
            AttributeType::Sign => ck::AttributeType::Sign,
            AttributeType::Value => ck::AttributeType::Value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ObjectClass {
    #[strum(serialize = "CKO_CERTIFICATE")]
    Certificate,
    #[strum(serialize = "CKO_PRIVATE_KEY")]
    PrivateKey,
}

impl From<ObjectClass> for ck::ObjectClass {
    fn from(class: ObjectClass) -> Self {
        match class {
            ObjectClass::Certificate => ck::ObjectClass::CERTIFICATE,
            ObjectClass::PrivateKey => ck::ObjectClass::PRIVATE_KEY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CertificateType {
    #[strum(serialize = "CKC_X_509")]
    X509,
}

impl From<CertificateType> for ck::CertificateType {
    fn from(certificate_type: CertificateType) -> Self {
        match certificate_type {
            CertificateType::X509 => ck::CertificateType::X_509,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    CertificateType(CertificateType),
    Class(ObjectClass),
    Id(Vec<u8>),
    Label(String),
    Sign(bool),
    Value(Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::CertificateType(_) => AttributeType::CertificateType,
            Attribute::Class(_) => AttributeType::Class,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Value(_) => AttributeType::Value,
        }
    }
}

impl From<&Attribute> for ck::Attribute {
    fn from(attribute: &Attribute) -> Self {
        match attribute {
            Attribute::CertificateType(certificate_type) => {
                ck::Attribute::CertificateType((*certificate_type).into())
            }
            Attribute::Class(class) => ck::Attribute::Class((*class).into()),
            Attribute::Id(id) => ck::Attribute::Id(id.clone()),
            Attribute::Label(label) => ck::Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Sign(sign) => ck::Attribute::Sign(*sign),
            Attribute::Value(value) => ck::Attribute::Value(value.clone()),
        }
    }
}

/// An ordered search template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn get(&self, attribute_type: AttributeType) -> Option<&Attribute> {
        self.0.iter().find(|attribute| attribute.attribute_type() == attribute_type)
    }

    pub fn push(&mut self, attribute: Attribute) {
        self.0.push(attribute);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attribute> {
        self.0.iter()
    }

    /// The template in the form the driver binding takes.
    pub fn to_cryptoki(&self) -> Vec<ck::Attribute> {
        self.0.iter().map(ck::Attribute::from).collect()
    }
}

impl From<Vec<Attribute>> for Attributes {
    fn from(attributes: Vec<Attribute>) -> Self {
        Self(attributes)
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
