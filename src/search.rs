use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Declarative selector naming where image fields live inside a document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_matcher: Option<KeyMatcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_matcher: Option<ValueMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathPart>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathPart {
    Field(String),
    #[serde(rename_all = "camelCase")]
    AllIndexes { all_indexes: bool },
    Index { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo: Option<String>,
}

/// Rules active when the configuration does not override them.
pub fn default_search_rules() -> Vec<SearchRule> {
    ["image", "sidecarImage"]
        .into_iter()
        .map(|name| SearchRule {
            key_matcher: Some(KeyMatcher {
                name: Some(name.to_string()),
                path: None,
            }),
            value_matcher: None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Field(String),
    Index(usize),
}

/// Locates image reference fields by an ordered rule list. The callback
/// returns the replacement value and whether to write it back in place.
pub struct ImageRefs<'a> {
    rules: &'a [SearchRule],
}

impl<'a> ImageRefs<'a> {
    pub fn new(rules: &'a [SearchRule]) -> ImageRefs<'a> {
        ImageRefs { rules }
    }

    pub fn visit<F>(&self, doc: &mut Value, f: &mut F)
    where
        F: FnMut(&str) -> (String, bool),
    {
        let mut path = Vec::new();
        self.visit_value(doc, &mut path, f);
    }

    fn visit_value<F>(&self, value: &mut Value, path: &mut Vec<Seg>, f: &mut F)
    where
        F: FnMut(&str) -> (String, bool),
    {
        match value {
            Value::Mapping(map) => {
                for (key, entry) in map.iter_mut() {
                    let Some(key) = key.as_str() else {
                        continue;
                    };
                    path.push(Seg::Field(key.to_string()));
                    self.visit_entry(entry, path, f);
                    path.pop();
                }
            }
            Value::Sequence(seq) => {
                for (index, entry) in seq.iter_mut().enumerate() {
                    path.push(Seg::Index(index));
                    self.visit_entry(entry, path, f);
                    path.pop();
                }
            }
            _ => {}
        }
    }

    fn visit_entry<F>(&self, entry: &mut Value, path: &mut Vec<Seg>, f: &mut F)
    where
        F: FnMut(&str) -> (String, bool),
    {
        if let Value::String(s) = entry {
            if self.rules.iter().any(|rule| rule_matches(rule, path, s)) {
                let (new_value, replace) = f(s);
                if replace {
                    *s = new_value;
                }
            }
        } else {
            self.visit_value(entry, path, f);
        }
    }
}

fn rule_matches(rule: &SearchRule, path: &[Seg], value: &str) -> bool {
    let key_ok = match &rule.key_matcher {
        None => true,
        Some(matcher) => {
            let name_ok = matcher.name.as_deref().is_some_and(|name| {
                matches!(path.last(), Some(Seg::Field(field)) if field == name)
            });
            let path_ok = matcher
                .path
                .as_deref()
                .is_some_and(|parts| path_matches(parts, path));
            name_ok || path_ok
        }
    };
    if !key_ok {
        return false;
    }

    match &rule.value_matcher {
        None => true,
        Some(matcher) => {
            let image_ok = matcher.image.as_deref().map_or(true, |image| image == value);
            let repo_ok = matcher
                .image_repo
                .as_deref()
                .map_or(true, |repo| repo_part(value) == repo);
            image_ok && repo_ok
        }
    }
}

fn path_matches(parts: &[PathPart], path: &[Seg]) -> bool {
    if parts.len() != path.len() {
        return false;
    }
    parts.iter().zip(path).all(|(part, seg)| match (part, seg) {
        (PathPart::Field(name), Seg::Field(field)) => name == field,
        (PathPart::Index { index }, Seg::Index(at)) => index == at,
        (PathPart::AllIndexes { all_indexes }, Seg::Index(_)) => *all_indexes,
        _ => false,
    })
}

fn repo_part(value: &str) -> &str {
    let value = value.split_once('@').map_or(value, |(repo, _)| repo);
    match value.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resource;
    use crate::test_data;

    fn collect(doc: &mut Value, rules: &[SearchRule]) -> Vec<String> {
        let mut found = Vec::new();
        ImageRefs::new(rules).visit(doc, &mut |image| {
            found.push(image.to_string());
            (String::new(), false)
        });
        found
    }

    #[test]
    fn test_default_rules_find_image_keys() {
        let mut resource = Resource::parse_stream(test_data::POD_YAML).unwrap().remove(0);
        let found = collect(resource.value_mut(), &default_search_rules());
        assert_eq!(found, vec!["nginx:1.19".to_string()]);
    }

    #[test]
    fn test_visit_rewrites_in_place() {
        let mut resource = Resource::parse_stream(test_data::POD_YAML).unwrap().remove(0);
        let rules = default_search_rules();
        ImageRefs::new(&rules).visit(resource.value_mut(), &mut |_| {
            ("nginx@sha256:bbb".to_string(), true)
        });

        let found = collect(resource.value_mut(), &rules);
        assert_eq!(found, vec!["nginx@sha256:bbb".to_string()]);
    }

    #[test]
    fn test_both_passes_observe_same_positions() {
        let mut collect_copy = Resource::parse_stream(test_data::TWO_PODS_YAML).unwrap();
        let mut rewrite_copy = collect_copy.clone();
        let rules = default_search_rules();

        let first = collect_copy
            .iter_mut()
            .flat_map(|r| collect(r.value_mut(), &rules))
            .collect::<Vec<_>>();
        let second = rewrite_copy
            .iter_mut()
            .flat_map(|r| collect(r.value_mut(), &rules))
            .collect::<Vec<_>>();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_path_rule_with_all_indexes() {
        let mut resource = Resource::parse_stream(
            "kind: App\nspec:\n  images:\n  - nginx:1.19\n  - redis:6\n",
        )
        .unwrap()
        .remove(0);

        let rules = vec![SearchRule {
            key_matcher: Some(KeyMatcher {
                name: None,
                path: Some(vec![
                    PathPart::Field("spec".to_string()),
                    PathPart::Field("images".to_string()),
                    PathPart::AllIndexes { all_indexes: true },
                ]),
            }),
            value_matcher: None,
        }];
        let found = collect(resource.value_mut(), &rules);
        assert_eq!(found, vec!["nginx:1.19".to_string(), "redis:6".to_string()]);
    }

    #[test]
    fn test_path_rule_with_index() {
        let mut resource = Resource::parse_stream(
            "kind: App\nspec:\n  images:\n  - nginx:1.19\n  - redis:6\n",
        )
        .unwrap()
        .remove(0);

        let rules = vec![SearchRule {
            key_matcher: Some(KeyMatcher {
                name: None,
                path: Some(vec![
                    PathPart::Field("spec".to_string()),
                    PathPart::Field("images".to_string()),
                    PathPart::Index { index: 1 },
                ]),
            }),
            value_matcher: None,
        }];
        let found = collect(resource.value_mut(), &rules);
        assert_eq!(found, vec!["redis:6".to_string()]);
    }

    #[test]
    fn test_value_matcher_image_repo() {
        let mut resource = Resource::parse_stream(
            "kind: Pod\nspec:\n  c1: nginx:1.19\n  c2: redis:6\n",
        )
        .unwrap()
        .remove(0);

        let rules = vec![SearchRule {
            key_matcher: None,
            value_matcher: Some(ValueMatcher {
                image: None,
                image_repo: Some("nginx".to_string()),
            }),
        }];
        let found = collect(resource.value_mut(), &rules);
        assert_eq!(found, vec!["nginx:1.19".to_string()]);
    }

    #[test]
    fn test_search_rule_yaml_shape() {
        let rule = serde_yaml::from_str::<SearchRule>(
            "keyMatcher:\n  path: [spec, images, {allIndexes: true}, {index: 0}]\n",
        )
        .unwrap();
        let path = rule.key_matcher.unwrap().path.unwrap();
        assert_eq!(
            path,
            vec![
                PathPart::Field("spec".to_string()),
                PathPart::Field("images".to_string()),
                PathPart::AllIndexes { all_indexes: true },
                PathPart::Index { index: 0 },
            ]
        );
    }
}
