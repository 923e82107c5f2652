//! 模块依赖管理
//!
//! - [`DependencyGraph`]：依赖关系图，支持环检测和确定性拓扑排序
//! - [`DependencyResolver`]：从一组模块描述生成加载计划，或给出结构化的失败
//!
//! # 示例
//!
//! ```rust
//! use chips_plugin_core::module::dependency::DependencyResolver;
//! use chips_plugin_core::module::metadata::{DependencySpec, ModuleDescriptor};
//! use semver::Version;
//!
//! let db = ModuleDescriptor::new("database", Version::new(1, 4, 0));
//! let auth = ModuleDescriptor::new("auth", Version::new(2, 0, 0))
//!     .with_dependency(DependencySpec::required("database", "^1.2"));
//!
//! let plan = DependencyResolver::resolve(&[auth, db]).unwrap();
//! assert_eq!(plan.order, vec!["database", "auth"]);
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::module::metadata::ModuleDescriptor;
use crate::utils::{CoreError, Result};

/// 依赖边：`from` 依赖 `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub constraint: String,
    pub optional: bool,
}

/// 模块依赖关系图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 -> 它依赖的模块
    edges: HashMap<String, Vec<DependencyEdge>>,
    /// 反向边：模块 -> 依赖它的模块
    reverse_edges: HashMap<String, Vec<String>>,
    /// 同层排序用的优先级
    priorities: HashMap<String, i32>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点，已存在时只更新优先级
    pub fn add_module(&mut self, name: &str, priority: i32) {
        self.edges.entry(name.to_string()).or_default();
        self.reverse_edges.entry(name.to_string()).or_default();
        self.priorities.insert(name.to_string(), priority);
    }

    /// 添加依赖边，两端节点不存在时以优先级 0 补齐
    pub fn add_edge(&mut self, edge: DependencyEdge) {
        for node in [&edge.from, &edge.to] {
            if !self.contains_module(node) {
                self.add_module(node, 0);
            }
        }

        let rev = self.reverse_edges.entry(edge.to.clone()).or_default();
        if !rev.contains(&edge.from) {
            rev.push(edge.from.clone());
        }

        let out = self.edges.entry(edge.from.clone()).or_default();
        if !out.iter().any(|e| e.to == edge.to) {
            out.push(edge);
        }
    }

    /// 移除模块及所有相关边
    pub fn remove_module(&mut self, name: &str) {
        if let Some(out) = self.edges.remove(name) {
            for edge in out {
                if let Some(rev) = self.reverse_edges.get_mut(&edge.to) {
                    rev.retain(|d| d != name);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(name) {
            for dependent in dependents {
                if let Some(out) = self.edges.get_mut(&dependent) {
                    out.retain(|e| e.to != name);
                }
            }
        }
        self.priorities.remove(name);
    }

    pub fn contains_module(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// 直接依赖（按名排序）
    pub fn get_dependencies(&self, name: &str) -> Vec<String> {
        let mut deps: Vec<String> = self
            .edges
            .get(name)
            .map(|out| out.iter().map(|e| e.to.clone()).collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// 直接依赖者（按名排序）
    pub fn get_dependents(&self, name: &str) -> Vec<String> {
        let mut dependents = self.reverse_edges.get(name).cloned().unwrap_or_default();
        dependents.sort();
        dependents
    }

    /// 所有直接和间接依赖者
    pub fn get_all_dependents(&self, name: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(node) = stack.pop() {
            for dependent in self.get_dependents(&node) {
                if visited.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        visited.into_iter().collect()
    }

    /// `from` 是否能沿依赖边到达 `to`
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(out) = self.edges.get(node) {
                stack.extend(out.iter().map(|e| e.to.as_str()));
            }
        }
        false
    }

    /// 邻接表：模块 -> 直接依赖（键和值都有序）
    pub fn adjacency(&self) -> BTreeMap<String, Vec<String>> {
        self.edges
            .keys()
            .map(|name| (name.clone(), self.get_dependencies(name)))
            .collect()
    }

    /// 全部依赖边（按 from、to 排序）
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut all: Vec<DependencyEdge> = self.edges.values().flatten().cloned().collect();
        all.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        all
    }

    /// 查找一个环
    ///
    /// 深度优先遍历，节点和邻居都按名排序，结果可复现。返回的链中每个模块
    /// 只出现一次，例如 `[a, b, c]` 表示 `a -> b -> c -> a`。
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut nodes: Vec<&String> = self.edges.keys().collect();
        nodes.sort();

        let mut visited = HashSet::new();
        for node in nodes {
            let mut on_stack = HashSet::new();
            let mut path = Vec::new();
            if let Some(cycle) = self.find_cycle_from(node, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// 只查找经过 `start` 可达的环
    pub fn find_cycle_through(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();
        self.find_cycle_from(start, &mut visited, &mut on_stack, &mut path)
    }

    fn find_cycle_from(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(node) {
            let start = path.iter().position(|n| n == node)?;
            return Some(path[start..].to_vec());
        }
        if !visited.insert(node.to_string()) {
            return None;
        }

        on_stack.insert(node.to_string());
        path.push(node.to_string());

        for next in self.get_dependencies(node) {
            if let Some(cycle) = self.find_cycle_from(&next, visited, on_stack, path) {
                return Some(cycle);
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    /// 拓扑排序（Kahn 算法）
    ///
    /// 依赖先于依赖者。没有边约束的模块按 (priority, name) 升序排列。
    ///
    /// # Errors
    ///
    /// 存在环时返回 `CircularDependency`
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        if let Some(chain) = self.find_cycle() {
            return Err(CoreError::CircularDependency { chain });
        }

        // 入度 = 该模块还未就绪的依赖数
        let mut in_degree: HashMap<&str, usize> = self
            .edges
            .iter()
            .map(|(name, out)| (name.as_str(), out.len()))
            .collect();

        let mut ready: BTreeSet<(i32, &str)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&name, _)| (self.priority(name), name))
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some(entry) = ready.iter().next().copied() {
            ready.remove(&entry);
            let (_, name) = entry;
            order.push(name.to_string());

            if let Some(dependents) = self.reverse_edges.get(name) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert((self.priority(dependent), dependent.as_str()));
                        }
                    }
                }
            }
        }

        if order.len() != self.edges.len() {
            return Err(CoreError::Internal(
                "拓扑排序未覆盖全部模块".to_string(),
            ));
        }
        Ok(order)
    }

    fn priority(&self, name: &str) -> i32 {
        self.priorities.get(name).copied().unwrap_or(0)
    }
}

/// 被省略的可选依赖
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OmittedDependency {
    pub module: String,
    pub dependency: String,
    /// 省略原因：缺失或会形成环
    pub reason: String,
}

/// 加载计划
#[derive(Debug, Clone)]
pub struct LoadPlan {
    /// 加载顺序
    pub order: Vec<String>,
    /// 未建立的可选依赖边
    pub omitted_optional: Vec<OmittedDependency>,
    /// 解析得到的依赖图
    pub graph: DependencyGraph,
}

/// 依赖解析器
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// 解析一组模块
    ///
    /// 检查顺序：重名、必需依赖缺失、版本约束、必需边上的环。
    /// 缺失的可选依赖不建边；会形成环的可选依赖同样不建边。
    pub fn resolve(descriptors: &[ModuleDescriptor]) -> Result<LoadPlan> {
        let mut by_name: BTreeMap<&str, &ModuleDescriptor> = BTreeMap::new();
        for desc in descriptors {
            if by_name.insert(desc.name.as_str(), desc).is_some() {
                return Err(CoreError::ModuleAlreadyLoaded(desc.name.clone()));
            }
        }

        let mut graph = DependencyGraph::new();
        for desc in by_name.values() {
            graph.add_module(&desc.name, desc.priority);
        }

        let mut optional_edges = Vec::new();
        let mut omitted_optional = Vec::new();

        for desc in by_name.values() {
            let mut deps: Vec<_> = desc.dependencies.iter().collect();
            deps.sort_by(|a, b| a.name.cmp(&b.name));

            for dep in deps {
                let Some(target) = by_name.get(dep.name.as_str()) else {
                    if dep.optional {
                        omitted_optional.push(OmittedDependency {
                            module: desc.name.clone(),
                            dependency: dep.name.clone(),
                            reason: "missing".to_string(),
                        });
                        continue;
                    }
                    return Err(CoreError::DependencyNotFound {
                        module: desc.name.clone(),
                        dependency: dep.name.clone(),
                        constraint: dep.constraint.clone(),
                    });
                };

                Self::check_version(&desc.name, dep, target)?;

                let edge = DependencyEdge {
                    from: desc.name.clone(),
                    to: dep.name.clone(),
                    constraint: dep.constraint.clone(),
                    optional: dep.optional,
                };
                if dep.optional {
                    optional_edges.push(edge);
                } else {
                    graph.add_edge(edge);
                }
            }
        }

        if let Some(chain) = graph.find_cycle() {
            return Err(CoreError::CircularDependency { chain });
        }

        for edge in optional_edges {
            if graph.has_path(&edge.to, &edge.from) {
                omitted_optional.push(OmittedDependency {
                    module: edge.from.clone(),
                    dependency: edge.to.clone(),
                    reason: "cycle".to_string(),
                });
                continue;
            }
            graph.add_edge(edge);
        }

        let order = graph.topological_sort()?;
        Ok(LoadPlan {
            order,
            omitted_optional,
            graph,
        })
    }

    /// 检查单个模块能否加入已加载集合
    ///
    /// 只检查与该模块相连的边：它的出边必须被已加载模块满足，
    /// 已加载模块指向它的边必须接受它的版本，且不能经由它形成环。
    /// 热重载替换时 `loaded` 中同名的旧描述会被忽略。
    pub fn recheck_module(
        replacement: &ModuleDescriptor,
        loaded: &[ModuleDescriptor],
    ) -> Result<()> {
        let others: HashMap<&str, &ModuleDescriptor> = loaded
            .iter()
            .filter(|d| d.name != replacement.name)
            .map(|d| (d.name.as_str(), d))
            .collect();

        let mut graph = DependencyGraph::new();
        graph.add_module(&replacement.name, replacement.priority);

        for dep in &replacement.dependencies {
            match others.get(dep.name.as_str()) {
                Some(target) => {
                    Self::check_version(&replacement.name, dep, target)?;
                    if !dep.optional {
                        graph.add_edge(DependencyEdge {
                            from: replacement.name.clone(),
                            to: dep.name.clone(),
                            constraint: dep.constraint.clone(),
                            optional: false,
                        });
                    }
                }
                None if dep.optional => {}
                None => {
                    return Err(CoreError::DependencyNotFound {
                        module: replacement.name.clone(),
                        dependency: dep.name.clone(),
                        constraint: dep.constraint.clone(),
                    })
                }
            }
        }

        for other in others.values() {
            for dep in &other.dependencies {
                if !dep.optional {
                    graph.add_edge(DependencyEdge {
                        from: other.name.clone(),
                        to: dep.name.clone(),
                        constraint: dep.constraint.clone(),
                        optional: false,
                    });
                }
                if dep.name == replacement.name {
                    Self::check_version(&other.name, dep, replacement)?;
                }
            }
        }

        if let Some(chain) = graph.find_cycle_through(&replacement.name) {
            return Err(CoreError::CircularDependency { chain });
        }
        Ok(())
    }

    fn check_version(
        module: &str,
        dep: &crate::module::metadata::DependencySpec,
        target: &ModuleDescriptor,
    ) -> Result<()> {
        let req = dep.requirement().map_err(|e| CoreError::InvalidManifest {
            module: module.to_string(),
            reason: format!("依赖 '{}' 的版本约束无效 '{}': {}", dep.name, dep.constraint, e),
        })?;
        if !req.matches(&target.version) {
            return Err(CoreError::VersionMismatch {
                module: module.to_string(),
                dependency: dep.name.clone(),
                required: dep.constraint.clone(),
                found: target.version.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::DependencySpec;
    use semver::Version;

    fn module(name: &str, version: &str) -> ModuleDescriptor {
        ModuleDescriptor::new(name, Version::parse(version).unwrap())
    }

    fn requires(desc: ModuleDescriptor, dep: &str, constraint: &str) -> ModuleDescriptor {
        desc.with_dependency(DependencySpec::required(dep, constraint))
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_graph_basic_operations() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(DependencyEdge {
            from: "a".into(),
            to: "b".into(),
            constraint: "*".into(),
            optional: false,
        });
        graph.add_edge(DependencyEdge {
            from: "c".into(),
            to: "b".into(),
            constraint: "*".into(),
            optional: false,
        });

        assert_eq!(graph.get_dependents("b"), vec!["a", "c"]);
        assert!(graph.has_path("a", "b"));
        assert!(!graph.has_path("b", "a"));

        graph.remove_module("b");
        assert!(!graph.contains_module("b"));
        assert!(graph.get_dependencies("a").is_empty());
    }

    #[test]
    fn test_dependencies_before_dependents() {
        let app = requires(requires(module("app", "1.0.0"), "service", "^1"), "cache", "*");
        let service = requires(module("service", "1.1.0"), "database", ">=1.0, <2.0");
        let cache = module("cache", "3.0.0");
        let database = module("database", "1.9.9");

        let plan = DependencyResolver::resolve(&[app, service, cache, database]).unwrap();
        let order = &plan.order;
        assert!(position(order, "database") < position(order, "service"));
        assert!(position(order, "service") < position(order, "app"));
        assert!(position(order, "cache") < position(order, "app"));
    }

    #[test]
    fn test_ties_broken_by_priority_then_name() {
        let modules = vec![
            module("zeta", "1.0.0"),
            module("alpha", "1.0.0").with_priority(5),
            module("beta", "1.0.0"),
            module("gamma", "1.0.0").with_priority(-1),
        ];
        let plan = DependencyResolver::resolve(&modules).unwrap();
        assert_eq!(plan.order, vec!["gamma", "beta", "zeta", "alpha"]);
    }

    #[test]
    fn test_cycle_reports_each_member_once() {
        let a = requires(module("a", "1.0.0"), "b", "*");
        let b = requires(module("b", "1.0.0"), "c", "*");
        let c = requires(module("c", "1.0.0"), "a", "*");
        let d = module("d", "1.0.0");

        let err = DependencyResolver::resolve(&[a, b, c, d]).unwrap_err();
        match err {
            CoreError::CircularDependency { ref chain } => {
                let mut members = chain.clone();
                members.sort();
                assert_eq!(members, vec!["a", "b", "c"]);
                assert!(err.to_string().contains("a -> b -> c -> a"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_optional_cycle_edge_is_dropped() {
        let a = requires(module("a", "1.0.0"), "b", "*");
        let b = module("b", "1.0.0").with_dependency(DependencySpec::optional("a", "*"));

        let plan = DependencyResolver::resolve(&[a, b]).unwrap();
        assert_eq!(plan.order, vec!["b", "a"]);
        assert_eq!(plan.omitted_optional.len(), 1);
        assert_eq!(plan.omitted_optional[0].reason, "cycle");
    }

    #[test]
    fn test_missing_optional_is_not_fatal() {
        let a = module("a", "1.0.0").with_dependency(DependencySpec::optional("metrics", "^1"));
        let plan = DependencyResolver::resolve(&[a]).unwrap();
        assert_eq!(plan.order, vec!["a"]);
        assert_eq!(plan.omitted_optional[0].dependency, "metrics");
    }

    #[test]
    fn test_missing_required_fails() {
        let a = requires(module("a", "1.0.0"), "database", "^1");
        let err = DependencyResolver::resolve(&[a]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::DependencyNotFound { ref dependency, .. } if dependency == "database"
        ));
    }

    #[test]
    fn test_version_mismatch_names_both_versions() {
        let a = requires(module("a", "1.0.0"), "database", ">=2.0.0");
        let db = module("database", "1.4.0");
        let err = DependencyResolver::resolve(&[a, db]).unwrap_err();
        match err {
            CoreError::VersionMismatch { required, found, .. } => {
                assert_eq!(required, ">=2.0.0");
                assert_eq!(found, "1.4.0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_optional_present_but_wrong_version_fails() {
        let a = module("a", "1.0.0").with_dependency(DependencySpec::optional("cache", "^2"));
        let cache = module("cache", "1.0.0");
        assert!(matches!(
            DependencyResolver::resolve(&[a, cache]),
            Err(CoreError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = DependencyResolver::resolve(&[module("a", "1.0.0"), module("a", "2.0.0")])
            .unwrap_err();
        assert!(matches!(err, CoreError::ModuleAlreadyLoaded(_)));
    }

    #[test]
    fn test_recheck_replacement() {
        let db = module("database", "1.0.0");
        let auth = requires(module("auth", "1.0.0"), "database", "^1");
        let loaded = vec![db.clone(), auth.clone()];

        // 兼容的新版本
        assert!(DependencyResolver::recheck_module(&module("database", "1.5.0"), &loaded).is_ok());

        // 依赖者不再接受
        assert!(matches!(
            DependencyResolver::recheck_module(&module("database", "2.0.0"), &loaded),
            Err(CoreError::VersionMismatch { .. })
        ));

        // 新版本引入环
        let cyclic = requires(module("database", "1.1.0"), "auth", "*");
        assert!(matches!(
            DependencyResolver::recheck_module(&cyclic, &loaded),
            Err(CoreError::CircularDependency { .. })
        ));

        // 新版本依赖未加载的模块
        let needs_cache = requires(module("auth", "1.1.0"), "cache", "*");
        assert!(matches!(
            DependencyResolver::recheck_module(&needs_cache, &loaded),
            Err(CoreError::DependencyNotFound { .. })
        ));
    }

    #[test]
    fn test_all_dependents_transitive() {
        let plan = DependencyResolver::resolve(&[
            module("db", "1.0.0"),
            requires(module("svc", "1.0.0"), "db", "*"),
            requires(module("app", "1.0.0"), "svc", "*"),
        ])
        .unwrap();
        assert_eq!(plan.graph.get_all_dependents("db"), vec!["app", "svc"]);
        assert_eq!(plan.graph.adjacency()["app"], vec!["svc"]);
    }
}
