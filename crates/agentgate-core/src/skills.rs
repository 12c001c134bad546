//! Skill discovery
//!
//! Skills live in `<root>/.claude/skills/<name>/SKILL.md`. User skills come
//! from the home directory; project skills from the working directory.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const SKILL_FILE: &str = "SKILL.md";

/// Where a skill was found
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkillLocation {
    User,
    Project,
}

/// One discovered skill
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillInfo {
    /// Directory name
    pub name: String,
    /// `description` from the YAML front matter
    pub description: Option<String>,
    pub location: SkillLocation,
    /// Full path to SKILL.md
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillsList {
    pub skills: Vec<SkillInfo>,
    pub count: usize,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    description: Option<String>,
}

/// List user skills under `home` and, when given, project skills under `cwd`
pub async fn list_skills(home: Option<&Path>, cwd: Option<&Path>) -> Result<SkillsList> {
    let mut skills = Vec::new();
    if let Some(home) = home {
        scan(&skills_dir(home), SkillLocation::User, &mut skills).await?;
    }
    if let Some(cwd) = cwd {
        scan(&skills_dir(cwd), SkillLocation::Project, &mut skills).await?;
    }

    Ok(SkillsList {
        count: skills.len(),
        skills,
        cwd: cwd.map(Path::to_path_buf),
    })
}

fn skills_dir(root: &Path) -> PathBuf {
    root.join(".claude").join("skills")
}

async fn scan(dir: &Path, location: SkillLocation, out: &mut Vec<SkillInfo>) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let skill_file = entry.path().join(SKILL_FILE);
        if !entry.file_type().await?.is_dir() || !fs::try_exists(&skill_file).await.unwrap_or(false) {
            continue;
        }
        let description = match fs::read_to_string(&skill_file).await {
            Ok(content) => extract_description(&content),
            Err(e) => {
                debug!("Cannot read {:?}: {}", skill_file, e);
                None
            }
        };
        found.push(SkillInfo {
            name: entry.file_name().to_string_lossy().to_string(),
            description,
            location,
            path: skill_file,
        });
    }

    // read_dir order is platform-dependent
    found.sort_by(|a, b| a.name.cmp(&b.name));
    out.extend(found);
    Ok(())
}

/// `description` from a `---` delimited YAML front matter block
pub fn extract_description(content: &str) -> Option<String> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    serde_yaml::from_str::<FrontMatter>(&rest[..end])
        .ok()?
        .description
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_skill(root: &Path, name: &str, content: &str) {
        let dir = skills_dir(root).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SKILL_FILE), content).unwrap();
    }

    #[test]
    fn test_extract_description() {
        let content = "---\nname: pdf\ndescription: Extract text from PDFs\n---\n# PDF\n";
        assert_eq!(
            extract_description(content),
            Some("Extract text from PDFs".to_string())
        );
        assert_eq!(extract_description("# no front matter"), None);
        assert_eq!(extract_description("---\n: : bad yaml [\n---\n"), None);
    }

    #[tokio::test]
    async fn test_list_user_and_project_skills() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write_skill(home.path(), "review", "---\ndescription: Review code\n---\n");
        write_skill(home.path(), "notes", "plain");
        write_skill(project.path(), "deploy", "---\ndescription: Ship it\n---\n");
        std::fs::create_dir_all(skills_dir(home.path()).join("empty")).unwrap();

        let list = list_skills(Some(home.path()), Some(project.path()))
            .await
            .unwrap();
        assert_eq!(list.count, 3);
        let names: Vec<&str> = list.skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["notes", "review", "deploy"]);
        assert_eq!(list.skills[1].description.as_deref(), Some("Review code"));
        assert_eq!(list.skills[2].location, SkillLocation::Project);
        assert_eq!(list.cwd.as_deref(), Some(project.path()));
    }

    #[tokio::test]
    async fn test_missing_directories_yield_empty_list() {
        let home = tempfile::tempdir().unwrap();
        let list = list_skills(Some(home.path()), None).await.unwrap();
        assert_eq!(list.count, 0);
        assert!(list.cwd.is_none());
    }
}
