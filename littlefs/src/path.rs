use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

pub trait Path: ToOwned {
    /// 返回以`/`开始、不以`/`结束、不包含相对项与重复`/`的绝对路径。
    ///
    /// 所有路径都相对于根目录解释，越过根目录的`..`返回`None`。
    fn canonicalize(&self) -> Option<Self::Owned>;

    /// 返回路径的`(父目录, 文件名)`，根目录返回`None`。
    ///
    /// 路径需已规范化。
    fn parent_file(&self) -> Option<(&Self, &Self)>;

    /// 依次返回各级目录项的名字，根目录没有任何一项
    fn components(&self) -> impl Iterator<Item = &Self>;

    /// `self`是否为`ancestor`或其子孙，路径需已规范化
    fn is_within(&self, ancestor: &Self) -> bool;

    fn join(&self, name: &Self) -> Self::Owned;
}

impl Path for str {
    fn canonicalize(&self) -> Option<String> {
        let mut cmps = Vec::new();
        for cmp in self.split('/') {
            match cmp {
                ".." => {
                    cmps.pop()?;
                }
                "." | "" => (),
                s => cmps.push(s),
            }
        }
        if cmps.is_empty() {
            return Some(String::from("/"));
        }
        cmps.insert(0, ""); // 在接下来的拼接中代表根目录

        Some(cmps.join("/"))
    }

    fn parent_file(&self) -> Option<(&Self, &Self)> {
        if self == "/" {
            return None;
        }

        self.rsplit_once('/')
            .map(|(p, f)| if p.is_empty() { ("/", f) } else { (p, f) })
    }

    fn components(&self) -> impl Iterator<Item = &Self> {
        self.split('/').filter(|s| !s.is_empty())
    }

    fn is_within(&self, ancestor: &Self) -> bool {
        ancestor == "/"
            || self
                .strip_prefix(ancestor)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    fn join(&self, name: &Self) -> String {
        if self == "/" {
            ["/", name].concat()
        } else {
            [self, "/", name].concat()
        }
    }
}
