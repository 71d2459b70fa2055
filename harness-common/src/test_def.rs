//! Test definitions and the runnable instances expanded from them.
//!
//! A [`Test`] is what a bundle author writes; [`Test::instantiate`] turns it
//! (optionally combined with one [`Param`]) into a validated [`TestInstance`]
//! named `category.FuncName` or `category.FuncName.param`.

use crate::registry::RegistryError;
use crate::testing::{Context, DEFAULT_EXIT_TIMEOUT, DEFAULT_TEST_TIMEOUT, Precondition, State};
use crate::types::{EntityInfo, EntityType};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Body of a test.
pub type TestFunc = Arc<dyn Fn(&Context, &State) + Send + Sync>;

/// Attribute prefixes the registry adds itself.
pub const RESERVED_ATTR_PREFIXES: &[&str] = &["name:", "bundle:", "dep:"];

/// `[a-z][a-z0-9]*`
fn valid_category(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// `[A-Z][A-Za-z0-9]*`
fn valid_func_name(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase()) && chars.all(|c| c.is_ascii_alphanumeric())
}

/// `[a-z0-9_]*`
fn valid_param_name(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// One parameterised variant of a [`Test`].
#[derive(Clone, Default)]
pub struct Param {
    /// Suffix appended to the test name. Empty means no suffix.
    pub name: String,
    pub value: Option<Arc<dyn Any + Send + Sync>>,
    pub extra_attr: Vec<String>,
    pub extra_data: Vec<String>,
    pub extra_software_deps: Vec<String>,
    pub pre: Option<Arc<dyn Precondition>>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.value = Some(Arc::new(value));
        self
    }

    pub fn extra_attr<I, S>(mut self, attr: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_attr.extend(attr.into_iter().map(Into::into));
        self
    }

    pub fn extra_data<I, S>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_data.extend(data.into_iter().map(Into::into));
        self
    }

    pub fn extra_software_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_software_deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn pre(mut self, pre: Arc<dyn Precondition>) -> Self {
        self.pre = Some(pre);
        self
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("has_value", &self.value.is_some())
            .field("extra_attr", &self.extra_attr)
            .field("extra_data", &self.extra_data)
            .field("extra_software_deps", &self.extra_software_deps)
            .field("pre", &self.pre.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

/// A test as declared by a bundle.
#[derive(Clone)]
pub struct Test {
    pub category: String,
    pub func_name: String,
    pub func: TestFunc,
    pub desc: String,
    pub contacts: Vec<String>,
    pub attr: Vec<String>,
    pub data: Vec<String>,
    pub software_deps: Vec<String>,
    pub service_deps: Vec<String>,
    pub pre: Option<Arc<dyn Precondition>>,
    pub timeout: Duration,
    pub exit_timeout: Duration,
    pub params: Vec<Param>,
}

impl Test {
    pub fn new(
        category: impl Into<String>,
        func_name: impl Into<String>,
        func: impl Fn(&Context, &State) + Send + Sync + 'static,
    ) -> Self {
        Self {
            category: category.into(),
            func_name: func_name.into(),
            func: Arc::new(func),
            desc: String::new(),
            contacts: Vec::new(),
            attr: Vec::new(),
            data: Vec::new(),
            software_deps: Vec::new(),
            service_deps: Vec::new(),
            pre: None,
            timeout: DEFAULT_TEST_TIMEOUT,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            params: Vec::new(),
        }
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn contacts<I, S>(mut self, contacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contacts = contacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn attr<I, S>(mut self, attr: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attr = attr.into_iter().map(Into::into).collect();
        self
    }

    pub fn data<I, S>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data = data.into_iter().map(Into::into).collect();
        self
    }

    pub fn software_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.software_deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn service_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn pre(mut self, pre: Arc<dyn Precondition>) -> Self {
        self.pre = Some(pre);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    /// Name of the instance built from `param`.
    pub fn instance_name(&self, param: Option<&Param>) -> String {
        match param {
            Some(p) if !p.name.is_empty() => {
                format!("{}.{}.{}", self.category, self.func_name, p.name)
            }
            _ => format!("{}.{}", self.category, self.func_name),
        }
    }

    /// Validate and resolve this test (with at most one parameter) into a
    /// runnable instance belonging to `bundle`.
    pub fn instantiate(&self, bundle: &str, param: Option<&Param>) -> Result<TestInstance, RegistryError> {
        let name = self.instance_name(param);
        if !valid_category(&self.category) {
            return Err(RegistryError::InvalidName {
                name,
                reason: format!("category {:?} must match [a-z][a-z0-9]*", self.category),
            });
        }
        if !valid_func_name(&self.func_name) {
            return Err(RegistryError::InvalidName {
                name,
                reason: format!("function {:?} must match [A-Z][A-Za-z0-9]*", self.func_name),
            });
        }
        if let Some(p) = param
            && !valid_param_name(&p.name)
        {
            return Err(RegistryError::InvalidName {
                name,
                reason: format!("parameter {:?} must match [a-z0-9_]*", p.name),
            });
        }

        let mut user_attr = self.attr.clone();
        let mut data = self.data.clone();
        let mut software_deps = self.software_deps.clone();
        let mut pre = self.pre.clone();
        let mut val = None;
        if let Some(p) = param {
            user_attr.extend(p.extra_attr.iter().cloned());
            data.extend(p.extra_data.iter().cloned());
            software_deps.extend(p.extra_software_deps.iter().cloned());
            if p.pre.is_some() {
                if pre.is_some() {
                    return Err(RegistryError::DuplicatePrecondition { name });
                }
                pre = p.pre.clone();
            }
            val = p.value.clone();
        }

        if let Some(attr) = user_attr
            .iter()
            .find(|a| RESERVED_ATTR_PREFIXES.iter().any(|prefix| a.starts_with(prefix)))
        {
            return Err(RegistryError::ReservedAttr {
                name,
                attr: attr.clone(),
            });
        }

        let mut attr = vec![format!("name:{name}"), format!("bundle:{bundle}")];
        attr.extend(software_deps.iter().map(|d| format!("dep:{d}")));
        attr.extend(user_attr);
        dedup_in_place(&mut attr);
        dedup_in_place(&mut data);
        dedup_in_place(&mut software_deps);

        let additional_time = crate::testing::additional_time(pre.as_ref().map(|p| p.timeout()));

        Ok(TestInstance {
            name,
            pkg: self.category.clone(),
            bundle: bundle.to_string(),
            func: self.func.clone(),
            val,
            desc: self.desc.clone(),
            contacts: self.contacts.clone(),
            attr,
            data,
            software_deps,
            service_deps: self.service_deps.clone(),
            pre,
            timeout: self.timeout,
            exit_timeout: self.exit_timeout,
            additional_time,
        })
    }
}

fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Fully resolved runnable test.
#[derive(Clone)]
pub struct TestInstance {
    pub name: String,
    /// Package the test belongs to; data files live under `<data_dir>/<pkg>/`.
    pub pkg: String,
    pub bundle: String,
    pub func: TestFunc,
    /// Parameter value, if built from a [`Param`] that carries one.
    pub val: Option<Arc<dyn Any + Send + Sync>>,
    pub desc: String,
    pub contacts: Vec<String>,
    pub attr: Vec<String>,
    pub data: Vec<String>,
    pub software_deps: Vec<String>,
    pub service_deps: Vec<String>,
    pub pre: Option<Arc<dyn Precondition>>,
    pub timeout: Duration,
    pub exit_timeout: Duration,
    pub additional_time: Duration,
}

impl TestInstance {
    pub fn precondition_name(&self) -> Option<&str> {
        self.pre.as_deref().map(|p| p.name())
    }

    /// Serializable description sent to the runner.
    pub fn entity_info(&self) -> EntityInfo {
        EntityInfo {
            name: self.name.clone(),
            pkg: self.pkg.clone(),
            bundle: self.bundle.clone(),
            kind: EntityType::Test,
            desc: self.desc.clone(),
            contacts: self.contacts.clone(),
            attr: self.attr.clone(),
            data: self.data.clone(),
            software_deps: self.software_deps.clone(),
            service_deps: self.service_deps.clone(),
            precondition: self.precondition_name().map(str::to_string),
            timeout: self.timeout,
            additional_time: self.additional_time,
        }
    }

    /// Software dependencies not listed in `available`, in declaration order.
    pub fn missing_software_deps(&self, available: &HashSet<String>) -> Vec<String> {
        self.software_deps
            .iter()
            .filter(|d| !available.contains(*d))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for TestInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestInstance")
            .field("name", &self.name)
            .field("pkg", &self.pkg)
            .field("bundle", &self.bundle)
            .field("attr", &self.attr)
            .field("data", &self.data)
            .field("software_deps", &self.software_deps)
            .field("pre", &self.precondition_name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
