//! Descriptions of the api resources that the controller and the config applier deal with,
//! organized by api group and version. For example, `build_openshift_io::v1::BuildConfig` or
//! `core::v1::Namespace`.
use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// A basic description of a Kubernetes resource, with just enough information to communicate
/// with the api server about it. You can define your own types by declaring a static:
///
/// ```no_run
/// use origin_controller::k8s_types::K8sType;
///
/// #[allow(non_upper_case_globals)]
/// pub static Widget: &K8sType = &K8sType {
///     api_version: "example.com/v1",
///     kind: "Widget",
///     plural_kind: "widgets",
///     namespaced: true,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
    /// Whether instances of this type live inside a namespace
    pub namespaced: bool,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

/// Creates a `&'static K8sType` at runtime **by leaking memory**. This is fine as long as it's only
/// done a bounded number of times, typically on startup.
pub fn define_type(
    api_version: String,
    kind: String,
    plural_kind: String,
    namespaced: bool,
) -> &'static K8sType {
    fn leak_str(s: String) -> &'static str {
        Box::leak(s.into_boxed_str())
    }

    let k8s_type = K8sType {
        api_version: leak_str(api_version),
        kind: leak_str(kind),
        plural_kind: leak_str(plural_kind),
        namespaced,
    };
    log::info!("Dynamically defining {:?}", k8s_type);
    Box::leak(Box::new(k8s_type))
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&str, &str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &str {
        self.as_group_and_version().1
    }

    /// returns true if the given apiVersion and kind identify this type
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        self.api_version == api_version && self.kind == kind
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr, $namespaced:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
            namespaced: $namespaced,
        };
    };
}

macro_rules! def_types {
    (@nogroupmod, $group:expr, [
        $( $version:ident => [
            $( $kind:ident ~ $plural_kind:ident : $namespaced:expr ),*
        ]),*
    ]) => {
        $(
            pub mod $version {
                $(
                    k8s_type!($kind, concat!($group, "/", stringify!($version)), stringify!($kind), stringify!($plural_kind), $namespaced);
                )*
            }
        )*
    };
    ($group:ident => $rem:tt ) => {
        pub mod $group {
            def_types!{@nogroupmod, stringify!($group), $rem }
        }
    };
    (@core => [
        $( $version:ident => [
            $( $kind:ident ~ $plural_kind:ident : $namespaced:expr ),*
        ]),*
    ]) => {
        pub mod core {
            $(pub mod $version {
                $(
                    k8s_type!($kind, stringify!($version), stringify!($kind), stringify!($plural_kind), $namespaced);
                )*
            })*
        }
    }
}

def_types! {
    @core => [
        v1 => [
            Namespace ~ namespaces: false,
            Pod ~ pods: true,
            PodTemplate ~ podtemplates: true,
            ReplicationController ~ replicationcontrollers: true,
            Service ~ services: true,
            Endpoints ~ endpoints: true,
            Secret ~ secrets: true,
            ConfigMap ~ configmaps: true,
            LimitRange ~ limitranges: true,
            PersistentVolumeClaim ~ persistentvolumeclaims: true,
            ResourceQuota ~ resourcequotas: true,
            ServiceAccount ~ serviceaccounts: true
        ]
    ]
}

def_types! {
    apps => [
        v1 => [
            DaemonSet ~ daemonsets: true,
            Deployment ~ deployments: true,
            ReplicaSet ~ replicasets: true,
            StatefulSet ~ statefulsets: true
        ]
    ]
}

def_types! {
    batch => [
        v1 => [
            Job ~ jobs: true
        ]
    ]
}

pub mod apps_openshift_io {
    def_types! {
        @nogroupmod, "apps.openshift.io", [
            v1 => [
                DeploymentConfig ~ deploymentconfigs: true
            ]
        ]
    }
}

pub mod authorization_openshift_io {
    def_types! {
        @nogroupmod, "authorization.openshift.io", [
            v1 => [
                Policy ~ policies: true,
                PolicyBinding ~ policybindings: true,
                Role ~ roles: true,
                RoleBinding ~ rolebindings: true
            ]
        ]
    }
}

pub mod build_openshift_io {
    def_types! {
        @nogroupmod, "build.openshift.io", [
            v1 => [
                BuildConfig ~ buildconfigs: true,
                Build ~ builds: true
            ]
        ]
    }
}

pub mod image_openshift_io {
    def_types! {
        @nogroupmod, "image.openshift.io", [
            v1 => [
                ImageStream ~ imagestreams: true
            ]
        ]
    }
}

pub mod route_openshift_io {
    def_types! {
        @nogroupmod, "route.openshift.io", [
            v1 => [
                Route ~ routes: true
            ]
        ]
    }
}

pub mod security_openshift_io {
    def_types! {
        @nogroupmod, "security.openshift.io", [
            v1 => [
                SecurityContextConstraints ~ securitycontextconstraints: false
            ]
        ]
    }
}

pub mod template_openshift_io {
    def_types! {
        @nogroupmod, "template.openshift.io", [
            v1 => [
                Template ~ templates: true
            ]
        ]
    }
}
