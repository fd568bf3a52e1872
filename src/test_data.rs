pub const POD_YAML: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: pod1
spec:
  containers:
  - name: web
    image: nginx:1.19
";

pub const TWO_PODS_YAML: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: pod1
spec:
  containers:
  - name: web
    image: nginx:1.19
---
apiVersion: v1
kind: Pod
metadata:
  name: pod2
spec:
  containers:
  - name: web
    image: nginx:1.19
";

pub const MYAPP_POD_YAML: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: pod3
spec:
  containers:
  - name: app
    image: myapp
";

pub const MYAPP_OVERRIDE_CONFIG_YAML: &str = "\
apiVersion: kbld.k14s.io/v1alpha1
kind: Config
overrides:
- image: myapp
  newImage: myapp@sha256:aaa
  preresolved: true
";

pub const CONFIG_YAML: &str = "\
apiVersion: kbld.k14s.io/v1alpha1
kind: Config
overrides:
- image: myapp
  newImage: myapp@sha256:aaa
  preresolved: true
sources:
- image: built
  path: app/
  docker:
    build:
      target: release
      pull: true
destinations:
- image: built
  newImage: docker.io/me/built
searchRules:
- keyMatcher:
    name: customImage
";
