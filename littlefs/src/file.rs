//! 文件内容
//!
//! 不超过`inline_max`的文件内联在目录项的结构记录中，
//! 更大的文件存放在 CTZ 跳表里。截断到`inline_max`以内时退回内联。

use alloc::vec;
use alloc::vec::Vec;

use block_dev::BlockDevice;
use vfs::Error;

use crate::block::DeviceExt;
use crate::ctz::CtzWriter;
use crate::dir::Struct;
use crate::LittleFs;

impl<D: BlockDevice> LittleFs<D> {
    fn check_size(&self, size: usize) -> Result<(), Error> {
        if size > self.cfg.file_max as usize {
            return Err(Error::FileTooLarge);
        }
        Ok(())
    }

    /// 读取`[pos, pos + len)`，越过文件末尾的部分被截去
    pub(crate) fn read_content(&self, st: &Struct, pos: usize, len: usize) -> Result<Vec<u8>, Error> {
        let size = st.size();
        if pos >= size {
            return Ok(Vec::new());
        }
        let end = pos.saturating_add(len).min(size);

        match st {
            Struct::Dir(_) => Err(Error::IsADirectory),
            Struct::Inline(data) => Ok(data[pos..end].to_vec()),
            Struct::Ctz(ctz) => {
                let bs = self.block_size();
                let mut buf = vec![0u8; end - pos];
                let mut done = 0;
                while done < buf.len() {
                    let (block, off) = self.ctz_find(*ctz, pos + done)?;
                    let n = (buf.len() - done).min(bs - off);
                    self.dev.read_at(block, off, &mut buf[done..done + n])?;
                    done += n;
                }
                Ok(buf)
            }
        }
    }

    /// 以`data`为全部内容的新结构
    pub(crate) fn new_content(&mut self, data: &[u8]) -> Result<Struct, Error> {
        self.check_size(data.len())?;
        if data.len() <= self.inline_max() {
            return Ok(Struct::Inline(data.to_vec()));
        }

        let mut writer = CtzWriter::new();
        self.ctz_write(&mut writer, data)?;
        Ok(Struct::Ctz(writer.finish()))
    }

    /// 在`pos`处写入`data`，返回新的结构。
    ///
    /// 跳表文件与旧结构共享`pos`之前的整块，其余部分写入新块；
    /// 旧结构在新结构提交之前保持不变。
    pub(crate) fn write_content(&mut self, old: &Struct, pos: usize, data: &[u8]) -> Result<Struct, Error> {
        let old_size = old.size();
        let end = pos
            .checked_add(data.len())
            .ok_or(Error::FileTooLarge)?
            .max(old_size);
        self.check_size(end)?;

        match old {
            Struct::Dir(_) => Err(Error::IsADirectory),
            Struct::Inline(bytes) => {
                let mut buf = bytes.clone();
                buf.resize(end, 0);
                buf[pos..pos + data.len()].copy_from_slice(data);
                self.new_content(&buf)
            }
            Struct::Ctz(ctz) => {
                let bs = self.block_size();
                let start = pos.min(old_size);
                let mut writer = if start == 0 {
                    CtzWriter::new()
                } else {
                    let (block, _) = self.ctz_find(*ctz, start - 1)?;
                    CtzWriter::extending(block, start)
                };

                // 空洞以0填充
                self.ctz_fill(&mut writer, pos - start)?;
                self.ctz_write(&mut writer, data)?;

                let mut copied = pos + data.len();
                while copied < old_size {
                    let chunk = self.read_content(old, copied, bs)?;
                    self.ctz_write(&mut writer, &chunk)?;
                    copied += chunk.len();
                }
                Ok(Struct::Ctz(writer.finish()))
            }
        }
    }

    pub(crate) fn truncate_content(&mut self, old: &Struct, size: usize) -> Result<Struct, Error> {
        let old_size = old.size();
        self.check_size(size)?;

        if size >= old_size {
            return if size == old_size {
                Ok(old.clone())
            } else {
                self.write_content(old, size, &[])
            };
        }

        match old {
            Struct::Dir(_) => Err(Error::IsADirectory),
            _ if size <= self.inline_max() => Ok(Struct::Inline(self.read_content(old, 0, size)?)),
            Struct::Ctz(ctz) => {
                let (block, _) = self.ctz_find(*ctz, size - 1)?;
                let mut ctz = *ctz;
                ctz.head = block.into();
                ctz.size = size as u32;
                Ok(Struct::Ctz(ctz))
            }
            Struct::Inline(data) => Ok(Struct::Inline(data[..size].to_vec())),
        }
    }
}
