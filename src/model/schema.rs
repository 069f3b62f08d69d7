use crate::error::{EngineError, EngineResult};
use crate::model::{generate_id, Id, Multiplicity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A namespace of the uploaded schema document. Packages nest; class names are
/// unique across the whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns_uri: Option<String>,
    #[serde(default)]
    pub data_types: Vec<DataTypeDef>,
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub subpackages: Vec<Package>,
}

/// A named primitive type. `kind` may be left out, in which case it is
/// inferred from the name the first time a value of this type is coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTypeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<crate::model::ScalarKind>,
}

/// Class as written in the schema document (own features only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDef {
    pub name: String,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub super_types: Vec<String>,
    #[serde(default)]
    pub features: Vec<FeatureDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeatureDef {
    Attribute(AttributeDef),
    Reference(ReferenceDef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    /// Data type name, either local ("EInt", "Age") or qualified by the
    /// namespace of another registered schema ("http://types#Age")
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub many: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDef {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub containment: bool,
}

impl FeatureDef {
    pub fn name(&self) -> &str {
        match self {
            FeatureDef::Attribute(a) => &a.name,
            FeatureDef::Reference(r) => &r.name,
        }
    }

    pub fn multiplicity(&self) -> Multiplicity {
        match self {
            FeatureDef::Attribute(a) => Multiplicity::from_many(a.many),
            FeatureDef::Reference(r) => Multiplicity::from_many(r.many),
        }
    }

    pub fn is_many(&self) -> bool {
        self.multiplicity().is_many()
    }

    pub fn is_containment(&self) -> bool {
        matches!(self, FeatureDef::Reference(r) if r.containment)
    }
}

/// A class with its inherited features merged in, as held by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDefinition {
    pub name: String,
    pub is_abstract: bool,
    pub super_types: Vec<String>,
    /// Namespace URI of the package declaring this class
    pub namespace: String,
    /// Own features first, then inherited ones
    features: Vec<FeatureDef>,
    own_feature_count: usize,
    /// Every transitive supertype
    ancestors: HashSet<String>,
}

impl ClassDefinition {
    pub fn all_features(&self) -> &[FeatureDef] {
        &self.features
    }

    pub fn own_features(&self) -> &[FeatureDef] {
        &self.features[..self.own_feature_count]
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureDef> {
        self.features.iter().find(|f| f.name() == name)
    }

    pub fn containment_features(&self) -> impl Iterator<Item = &FeatureDef> {
        self.features.iter().filter(|f| f.is_containment())
    }

    /// Whether a "name" attribute is defined on this class (own or inherited)
    pub fn name_attribute(&self) -> Option<&AttributeDef> {
        self.features.iter().find_map(|f| match f {
            FeatureDef::Attribute(a) if a.name == "name" => Some(a),
            _ => None,
        })
    }

    pub fn conforms_to(&self, class_name: &str) -> bool {
        self.name == class_name || self.ancestors.contains(class_name)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    /// Unique per load, even when two uploads share a namespace
    pub id: Id,
    pub name: String,
    pub ns_uri: String,
    document: Package,
    classes: Vec<ClassDefinition>,
    data_types: HashMap<String, DataTypeDef>,
}

impl Schema {
    /// Parse and validate a schema document.
    pub fn parse(bytes: &[u8]) -> EngineResult<Self> {
        let mut document: Package = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::schema(format!("malformed schema document: {}", e)))?;
        if document.name.trim().is_empty() {
            return Err(EngineError::schema("package name is required"));
        }
        normalize_ns_uris(&mut document);
        Self::from_document(document)
    }

    pub fn from_document(document: Package) -> EngineResult<Self> {
        let ns_uri = document
            .ns_uri
            .clone()
            .unwrap_or_else(|| document.name.clone());

        let mut declared: Vec<(String, &ClassDef)> = Vec::new();
        let mut data_types = HashMap::new();
        collect_package(&document, &mut declared, &mut data_types)?;

        let by_name: HashMap<&str, &ClassDef> = declared
            .iter()
            .map(|(_, c)| (c.name.as_str(), *c))
            .collect();

        for (_, class) in &declared {
            for super_type in &class.super_types {
                if !by_name.contains_key(super_type.as_str()) {
                    return Err(EngineError::schema(format!(
                        "class '{}' extends unknown class '{}'",
                        class.name, super_type
                    )));
                }
            }
            for feature in &class.features {
                match feature {
                    FeatureDef::Reference(r) if !by_name.contains_key(r.target.as_str()) => {
                        return Err(EngineError::schema(format!(
                            "reference '{}.{}' targets unknown class '{}'",
                            class.name, r.name, r.target
                        )));
                    }
                    FeatureDef::Attribute(a) if a.data_type.trim().is_empty() => {
                        return Err(EngineError::schema(format!(
                            "attribute '{}.{}' has no type",
                            class.name, a.name
                        )));
                    }
                    _ => {}
                }
            }
        }

        let mut classes = Vec::with_capacity(declared.len());
        for (namespace, class) in &declared {
            let ancestors = collect_ancestors(class, &by_name)?;
            let features = merge_features(class, &by_name)?;
            classes.push(ClassDefinition {
                name: class.name.clone(),
                is_abstract: class.is_abstract,
                super_types: class.super_types.clone(),
                namespace: namespace.clone(),
                own_feature_count: class.features.len(),
                features,
                ancestors,
            });
        }

        Ok(Self {
            id: generate_id(),
            name: document.name.clone(),
            ns_uri,
            document,
            classes,
            data_types,
        })
    }

    /// Find a class by name: exact match anywhere in the package tree first,
    /// then a case-insensitive match.
    pub fn find_class(&self, name: &str) -> Option<&ClassDefinition> {
        self.classes
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.classes.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    /// Exact lookup, used for class names already stored on instances
    pub fn class(&self, name: &str) -> Option<&ClassDefinition> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn classes(&self) -> &[ClassDefinition] {
        &self.classes
    }

    pub fn all_features<'a>(&self, class: &'a ClassDefinition) -> &'a [FeatureDef] {
        class.all_features()
    }

    pub fn data_type(&self, name: &str) -> Option<&DataTypeDef> {
        self.data_types.get(name)
    }

    pub fn document(&self) -> &Package {
        &self.document
    }
}

/// Packages without a namespace identity get one derived from their name.
fn normalize_ns_uris(package: &mut Package) {
    if package.ns_uri.as_deref().map_or(true, str::is_empty) {
        package.ns_uri = Some(package.name.clone());
    }
    for sub in &mut package.subpackages {
        normalize_ns_uris(sub);
    }
}

fn collect_package<'a>(
    package: &'a Package,
    classes: &mut Vec<(String, &'a ClassDef)>,
    data_types: &mut HashMap<String, DataTypeDef>,
) -> EngineResult<()> {
    let namespace = package
        .ns_uri
        .clone()
        .unwrap_or_else(|| package.name.clone());

    for data_type in &package.data_types {
        if data_types
            .insert(data_type.name.clone(), data_type.clone())
            .is_some()
        {
            return Err(EngineError::schema(format!(
                "duplicate data type '{}'",
                data_type.name
            )));
        }
    }
    for class in &package.classes {
        if class.name.trim().is_empty() {
            return Err(EngineError::schema(format!(
                "unnamed class in package '{}'",
                package.name
            )));
        }
        if classes.iter().any(|(_, c)| c.name == class.name) {
            return Err(EngineError::schema(format!(
                "duplicate class '{}'",
                class.name
            )));
        }
        classes.push((namespace.clone(), class));
    }
    for sub in &package.subpackages {
        collect_package(sub, classes, data_types)?;
    }
    Ok(())
}

fn collect_ancestors(
    class: &ClassDef,
    by_name: &HashMap<&str, &ClassDef>,
) -> EngineResult<HashSet<String>> {
    let mut ancestors = HashSet::new();
    let mut stack: Vec<&str> = class.super_types.iter().map(String::as_str).collect();
    while let Some(name) = stack.pop() {
        if name == class.name {
            return Err(EngineError::schema(format!(
                "class '{}' inherits from itself",
                class.name
            )));
        }
        if ancestors.insert(name.to_string()) {
            if let Some(super_class) = by_name.get(name) {
                stack.extend(super_class.super_types.iter().map(String::as_str));
            }
        }
    }
    Ok(ancestors)
}

/// Own features first, then each supertype's merged features in declaration
/// order. A feature reached twice through a diamond is kept once; two distinct
/// features with the same name are rejected.
fn merge_features(
    class: &ClassDef,
    by_name: &HashMap<&str, &ClassDef>,
) -> EngineResult<Vec<FeatureDef>> {
    let mut merged: Vec<(String, FeatureDef)> = Vec::new();
    let mut visited = HashSet::new();
    merge_into(class, by_name, &mut merged, &mut visited)?;
    Ok(merged.into_iter().map(|(_, f)| f).collect())
}

fn merge_into(
    class: &ClassDef,
    by_name: &HashMap<&str, &ClassDef>,
    merged: &mut Vec<(String, FeatureDef)>,
    visited: &mut HashSet<String>,
) -> EngineResult<()> {
    if !visited.insert(class.name.clone()) {
        return Ok(());
    }
    for feature in &class.features {
        if let Some((owner, _)) = merged.iter().find(|(_, f)| f.name() == feature.name()) {
            return Err(EngineError::schema(format!(
                "feature '{}' is declared by both '{}' and '{}'",
                feature.name(),
                owner,
                class.name
            )));
        }
        merged.push((class.name.clone(), feature.clone()));
    }
    for super_type in &class.super_types {
        if let Some(super_class) = by_name.get(super_type.as_str()) {
            merge_into(super_class, by_name, merged, visited)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn parse(doc: serde_json::Value) -> EngineResult<Schema> {
        Schema::parse(doc.to_string().as_bytes())
    }

    fn company() -> Schema {
        parse(json!({
            "name": "company",
            "classes": [
                { "name": "Named", "abstract": true, "features": [
                    { "kind": "attribute", "name": "name", "type": "EString" }
                ]},
                { "name": "Person", "superTypes": ["Named"], "features": [
                    { "kind": "attribute", "name": "age", "type": "EInt" }
                ]}
            ],
            "subpackages": [
                { "name": "org", "nsUri": "http://company/org", "classes": [
                    { "name": "Team", "superTypes": ["Named"], "features": [
                        { "kind": "reference", "name": "members", "target": "Person",
                          "many": true, "containment": true }
                    ]}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_namespace_defaults_to_name() {
        let schema = company();
        assert_eq!(schema.ns_uri, "company");
        assert_eq!(schema.document().ns_uri.as_deref(), Some("company"));
        assert_eq!(schema.find_class("Team").unwrap().namespace, "http://company/org");
    }

    #[test]
    fn test_find_class_exact_then_case_insensitive() {
        let schema = company();
        assert_eq!(schema.find_class("Team").unwrap().name, "Team");
        assert_eq!(schema.find_class("person").unwrap().name, "Person");
        assert!(schema.find_class("Robot").is_none());
        assert!(schema.class("person").is_none());
    }

    #[test]
    fn test_exact_match_wins_over_case_insensitive() {
        let schema = parse(json!({
            "name": "p",
            "classes": [{ "name": "item" }],
            "subpackages": [{ "name": "q", "classes": [{ "name": "Item" }] }]
        }))
        .unwrap();
        assert_eq!(schema.find_class("Item").unwrap().namespace, "q");
        assert_eq!(schema.find_class("item").unwrap().namespace, "p");
    }

    #[test]
    fn test_all_features_own_first() {
        let schema = company();
        let person = schema.find_class("Person").unwrap();
        let names: Vec<_> = schema.all_features(person).iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["age", "name"]);
        assert_eq!(person.own_features().len(), 1);
        assert!(person.conforms_to("Named"));
        assert!(person.name_attribute().is_some());
    }

    #[test]
    fn test_diamond_inheritance_keeps_feature_once() {
        let schema = parse(json!({
            "name": "d",
            "classes": [
                { "name": "A", "features": [{ "kind": "attribute", "name": "x", "type": "int" }] },
                { "name": "B", "superTypes": ["A"] },
                { "name": "C", "superTypes": ["A"] },
                { "name": "D", "superTypes": ["B", "C"] }
            ]
        }))
        .unwrap();
        assert_eq!(schema.find_class("D").unwrap().all_features().len(), 1);
    }

    #[test]
    fn test_rejects_structural_errors() {
        let cases = vec![
            json!({ "name": "x", "classes": [{ "name": "A" }, { "name": "A" }] }),
            json!({ "name": "x", "classes": [{ "name": "A", "superTypes": ["Missing"] }] }),
            json!({ "name": "x", "classes": [
                { "name": "A", "superTypes": ["B"] }, { "name": "B", "superTypes": ["A"] }
            ]}),
            json!({ "name": "x", "classes": [{ "name": "A", "features": [
                { "kind": "reference", "name": "r", "target": "Nope" }
            ]}]}),
            json!({ "name": "x", "classes": [
                { "name": "A", "features": [{ "kind": "attribute", "name": "n", "type": "int" }] },
                { "name": "B", "superTypes": ["A"], "features": [
                    { "kind": "attribute", "name": "n", "type": "int" }
                ]}
            ]}),
            json!({ "name": "", "classes": [] }),
        ];
        for case in cases {
            let err = parse(case.clone()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SchemaParseError, "case {}", case);
        }
        let err = Schema::parse(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaParseError);
    }
}
